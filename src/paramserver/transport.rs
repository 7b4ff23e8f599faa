//! Transport seam between trainers and the aggregation loop.
//!
//! The server only ever talks to a [`Transport`]. [`ChannelTransport`] is the
//! in-process implementation: trainers connect through [`TrainerClient`]
//! handles, their frames go through a background dispatch loop that holds
//! them at the phase gate, and released parameters are handed out as
//! immutable generation-stamped snapshots.

use crate::core::{Error, Result};
use crate::paramserver::message::GradientMessage;
use crate::paramserver::variable::Variable;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which half of a round the server is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Receiving gradients from trainers
    Accepting,
    /// Handing updated parameters back to trainers
    Serving,
}

/// Parameters released at the end of a round.
#[derive(Clone, Debug, Default)]
pub struct Release {
    /// Incremented on every publish; 0 means nothing released yet
    pub generation: u64,
    /// Serialized parameter values by name
    pub vars: HashMap<String, Vec<u8>>,
}

impl Release {
    /// Decode one released parameter.
    pub fn get(&self, name: &str) -> Result<Variable> {
        let bytes = self
            .vars
            .get(name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        Variable::from_bytes(bytes)
    }
}

/// Everything the aggregation loop needs from the network layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Accept/dispatch loop. Runs on a background task and returns once
    /// shutdown has begun.
    async fn serve(&self) -> Result<()>;

    /// Next inbound message, blocking while the queue is empty.
    async fn pull(&self) -> Result<GradientMessage>;

    /// Enqueue a message as if it came off the network.
    fn push_self(&self, msg: GradientMessage) -> Result<()>;

    /// Switch between accepting gradients and serving parameters.
    fn set_accepting_phase(&self, accepting: bool);

    /// Make a round's updated parameters available to trainers.
    fn publish_release(&self, vars: HashMap<String, Vec<u8>>);

    /// Block until `expected` trainers have fetched the current release.
    async fn await_acknowledgements(&self, expected: usize) -> Result<()>;

    /// Stop accepting connections and wind down the dispatch loop.
    fn begin_shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// In-process transport backed by tokio channels.
pub struct ChannelTransport {
    endpoint: String,
    queue_tx: mpsc::UnboundedSender<GradientMessage>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<GradientMessage>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    phase_tx: watch::Sender<Phase>,
    release_tx: watch::Sender<Arc<Release>>,
    ack_tx: mpsc::UnboundedSender<u64>,
    ack_rx: Mutex<mpsc::UnboundedReceiver<u64>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ChannelTransport {
    /// Create a transport for the given endpoint. Starts in the accepting phase.
    pub fn new(endpoint: &str) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(Phase::Accepting);
        let (release_tx, _) = watch::channel(Arc::new(Release::default()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            endpoint: endpoint.to_string(),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            phase_tx,
            release_tx,
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
            shutdown_tx,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    /// Generation of the most recent release.
    pub fn current_generation(&self) -> u64 {
        self.release_tx.borrow().generation
    }

    /// Open a trainer connection.
    pub fn connect(&self) -> Result<TrainerClient> {
        if self.is_shutdown() {
            return Err(Error::ShuttingDown);
        }

        let client = TrainerClient {
            id: Uuid::new_v4(),
            frames: self.inbound_tx.clone(),
            releases: self.release_tx.subscribe(),
            acks: self.ack_tx.clone(),
            shutdown: self.shutdown_tx.subscribe(),
            last_generation: self.current_generation(),
        };
        debug!(endpoint = %self.endpoint, trainer = %client.id, "trainer connected");
        Ok(client)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn serve(&self) -> Result<()> {
        let mut inbound = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("dispatch loop already running".into()))?;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut phase = self.phase_tx.subscribe();

        info!(endpoint = %self.endpoint, "server listening");

        loop {
            let frame = tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let msg = match GradientMessage::from_frame(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "dropping malformed frame");
                    continue;
                }
            };

            // Hold the message until the server is taking gradients again.
            let gate_open = tokio::select! {
                _ = wait_shutdown(&mut shutdown) => false,
                res = phase.wait_for(|p| *p == Phase::Accepting) => res.is_ok(),
            };
            if !gate_open {
                break;
            }

            if self.queue_tx.send(msg).is_err() {
                break;
            }
        }

        info!(endpoint = %self.endpoint, "server thread end");
        Ok(())
    }

    async fn pull(&self) -> Result<GradientMessage> {
        let mut queue = self.queue_rx.lock().await;
        queue.recv().await.ok_or(Error::ChannelClosed)
    }

    fn push_self(&self, msg: GradientMessage) -> Result<()> {
        self.queue_tx.send(msg).map_err(|_| Error::ChannelClosed)
    }

    fn set_accepting_phase(&self, accepting: bool) {
        let phase = if accepting {
            Phase::Accepting
        } else {
            Phase::Serving
        };
        self.phase_tx.send_replace(phase);
    }

    fn publish_release(&self, vars: HashMap<String, Vec<u8>>) {
        self.release_tx.send_modify(|current| {
            *current = Arc::new(Release {
                generation: current.generation + 1,
                vars,
            });
        });
    }

    async fn await_acknowledgements(&self, expected: usize) -> Result<()> {
        let generation = self.current_generation();
        let mut acks = self.ack_rx.lock().await;
        let mut counted = 0;

        while counted < expected {
            match acks.recv().await {
                Some(g) if g == generation => counted += 1,
                Some(stale) => {
                    debug!(stale, generation, "discarding acknowledgement for an earlier release")
                }
                None => return Err(Error::ChannelClosed),
            }
        }
        Ok(())
    }

    fn begin_shutdown(&self) {
        let already = self.shutdown_tx.send_replace(true);
        if !already {
            info!(endpoint = %self.endpoint, "shutting down transport");
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// A trainer's connection to a [`ChannelTransport`].
pub struct TrainerClient {
    id: Uuid,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    releases: watch::Receiver<Arc<Release>>,
    acks: mpsc::UnboundedSender<u64>,
    shutdown: watch::Receiver<bool>,
    last_generation: u64,
}

impl TrainerClient {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send a raw message.
    pub fn send(&self, msg: &GradientMessage) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }
        let frame = msg.to_frame()?;
        self.frames.send(frame).map_err(|_| Error::ChannelClosed)
    }

    /// Send a variable value under `name`.
    pub fn send_variable(&self, name: &str, value: &Variable) -> Result<()> {
        self.send(&GradientMessage::data(name, value.to_bytes()?))
    }

    /// Tell the server this trainer is done for the round.
    pub fn send_barrier(&self) -> Result<()> {
        self.send(&GradientMessage::barrier())
    }

    /// Wait for a release newer than the last one fetched, and acknowledge it.
    pub async fn fetch_release(&mut self) -> Result<Arc<Release>> {
        let last = self.last_generation;
        let release = tokio::select! {
            res = self.releases.wait_for(|r| r.generation > last) => {
                res.map(|r| Arc::clone(&r)).map_err(|_| Error::ChannelClosed)
            }
            _ = wait_shutdown(&mut self.shutdown) => Err(Error::ShuttingDown),
        }?;

        self.last_generation = release.generation;
        self.acks
            .send(release.generation)
            .map_err(|_| Error::ChannelClosed)?;
        Ok(release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramserver::message::MessageKind;
    use crate::paramserver::variable::DenseTensor;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn start(transport: &Arc<ChannelTransport>) -> tokio::task::JoinHandle<Result<()>> {
        let t = transport.clone();
        tokio::spawn(async move { t.serve().await })
    }

    fn weights(values: &[f32]) -> HashMap<String, Vec<u8>> {
        let w = Variable::Dense(DenseTensor::new(vec![values.len()], values.to_vec()).unwrap());
        HashMap::from([("w".to_string(), w.to_bytes().unwrap())])
    }

    #[tokio::test]
    async fn test_push_self_bypasses_network() {
        let transport = ChannelTransport::new("127.0.0.1:6164");
        transport.push_self(GradientMessage::terminate()).unwrap();
        let msg = transport.pull().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Terminate);
    }

    #[tokio::test]
    async fn test_frames_preserve_order_per_trainer() {
        let transport = Arc::new(ChannelTransport::new("127.0.0.1:6164"));
        let server = start(&transport);
        let client = transport.connect().unwrap();

        let w = Variable::Dense(DenseTensor::zeros(&[2]));
        client.send_variable("w@GRAD", &w).unwrap();
        client.send_barrier().unwrap();

        let first = transport.pull().await.unwrap();
        let second = transport.pull().await.unwrap();
        assert_eq!(first.name, "w@GRAD");
        assert_eq!(Variable::from_bytes(&first.payload).unwrap(), w);
        assert_eq!(second.kind, MessageKind::Barrier);

        transport.begin_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gate_holds_frames_while_serving() {
        let transport = Arc::new(ChannelTransport::new("127.0.0.1:6164"));
        transport.set_accepting_phase(false);
        let server = start(&transport);
        let client = transport.connect().unwrap();

        client.send_barrier().unwrap();
        assert!(timeout(Duration::from_millis(50), transport.pull())
            .await
            .is_err());

        transport.set_accepting_phase(true);
        let msg = timeout(Duration::from_secs(1), transport.pull())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, MessageKind::Barrier);

        transport.begin_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let transport = Arc::new(ChannelTransport::new("127.0.0.1:6164"));
        let server = start(&transport);
        let client = transport.connect().unwrap();

        client.frames.send(vec![0xde, 0xad]).unwrap();
        client.send_barrier().unwrap();

        let msg = transport.pull().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Barrier);

        transport.begin_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fetch_waits_for_new_release() {
        let transport = ChannelTransport::new("127.0.0.1:6164");
        let mut client = transport.connect().unwrap();

        let mut fetch = task::spawn(client.fetch_release());
        assert_pending!(fetch.poll());

        transport.publish_release(weights(&[0.5, 1.5]));
        assert!(fetch.is_woken());
        let release = assert_ready_ok!(fetch.poll());
        assert_eq!(release.generation, 1);
        let w = release.get("w").unwrap();
        assert_eq!(w.as_dense().unwrap().data, vec![0.5, 1.5]);
    }

    #[tokio::test]
    async fn test_stale_acknowledgements_are_discarded() {
        let transport = ChannelTransport::new("127.0.0.1:6164");
        let mut early = transport.connect().unwrap();
        let mut late = transport.connect().unwrap();

        transport.publish_release(weights(&[1.0]));
        early.fetch_release().await.unwrap();

        transport.publish_release(weights(&[2.0]));
        let mut waiting = task::spawn(transport.await_acknowledgements(1));
        // the only queued ack belongs to generation 1
        assert_pending!(waiting.poll());

        let release = late.fetch_release().await.unwrap();
        assert_eq!(release.generation, 2);
        assert_ready_ok!(waiting.poll());
    }

    #[tokio::test]
    async fn test_zero_acknowledgements_returns_immediately() {
        let transport = ChannelTransport::new("127.0.0.1:6164");
        transport.await_acknowledgements(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch_and_refuses_connections() {
        let transport = Arc::new(ChannelTransport::new("127.0.0.1:6164"));
        let server = start(&transport);
        let mut client = transport.connect().unwrap();

        assert!(!transport.is_shutdown());
        transport.begin_shutdown();
        transport.begin_shutdown();
        assert!(transport.is_shutdown());

        server.await.unwrap().unwrap();
        assert!(matches!(transport.connect(), Err(Error::ShuttingDown)));
        assert!(matches!(client.send_barrier(), Err(Error::ShuttingDown)));
        assert!(matches!(
            client.fetch_release().await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let transport = Arc::new(ChannelTransport::new("127.0.0.1:6164"));
        let server = start(&transport);
        while transport.inbound_rx.lock().await.is_some() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(transport.serve().await, Err(Error::Internal(_))));
        transport.begin_shutdown();
        server.await.unwrap().unwrap();
    }
}
