//! Receive phase of a synchronization round.
//!
//! Drains the transport queue until every trainer has sent its barrier,
//! routing each variable into storage. Arrival order across trainers does
//! not matter: completion depends only on the barrier count, and same-named
//! gradients from different trainers land in distinct per-trainer slots.

use crate::core::{Error, Result, RoundId};
use crate::paramserver::config::ServerConfig;
use crate::paramserver::message::{GradientMessage, MessageKind};
use crate::paramserver::transport::Transport;
use crate::paramserver::variable::{VarKind, VariableStore};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Name of trainer `index`'s copy of `base`.
pub fn trainer_var_name(base: &str, index: usize) -> String {
    format!("{}.trainer_{}", base, index)
}

/// Gradient name to parameter name lookup.
#[derive(Clone, Debug, Default)]
pub struct ParamGradMapping {
    grad_to_param: HashMap<String, String>,
}

impl ParamGradMapping {
    /// Build from parallel parameter and gradient lists.
    pub fn new(param_list: &[String], grad_list: &[String]) -> Result<Self> {
        if param_list.len() != grad_list.len() {
            return Err(Error::InvalidConfig(format!(
                "param_list has {} entries but grad_list has {}",
                param_list.len(),
                grad_list.len()
            )));
        }

        let grad_to_param = grad_list
            .iter()
            .cloned()
            .zip(param_list.iter().cloned())
            .collect();
        Ok(Self { grad_to_param })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(&config.param_list, &config.grad_list)
    }

    /// Parameter updated by `grad`, if any.
    pub fn param_for(&self, grad: &str) -> Option<&str> {
        self.grad_to_param.get(grad).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.grad_to_param.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grad_to_param.is_empty()
    }
}

/// Per-round suffix allocator for gradient copies.
#[derive(Debug, Default)]
pub struct TrainerSuffixCounter {
    next: HashMap<String, usize>,
}

impl TrainerSuffixCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next per-trainer name for `base`.
    pub fn next_name(&mut self, base: &str) -> String {
        let index = self.next.entry(base.to_string()).or_insert(0);
        let name = trainer_var_name(base, *index);
        *index += 1;
        name
    }

    pub fn clear(&mut self) {
        self.next.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}

/// Slots that received a sparse-row value this round.
#[derive(Debug, Default)]
pub struct SparseUpdateSet {
    names: BTreeSet<String>,
}

impl SparseUpdateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String) {
        self.names.insert(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.names.iter()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Counters for one round's receive phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Round number
    pub round: RoundId,
    /// Barriers observed
    pub barriers: usize,
    /// Data messages observed
    pub received: usize,
    /// Distinct parameters with at least one gradient this round
    pub updated: usize,
    /// Data messages that could not be stored
    pub rejected: usize,
    /// A terminate message ended the round
    pub terminated: bool,
}

/// What the drain loop does after a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundStep {
    Continue,
    Complete,
    Terminate,
}

/// Owns all per-round transient state.
#[derive(Debug)]
pub struct RoundCoordinator {
    fan_in: usize,
    mapping: ParamGradMapping,
    suffixes: TrainerSuffixCounter,
    sparse: SparseUpdateSet,
    updated_params: HashSet<String>,
    next_round: RoundId,
}

impl RoundCoordinator {
    pub fn new(fan_in: usize, mapping: ParamGradMapping) -> Self {
        Self {
            fan_in,
            mapping,
            suffixes: TrainerSuffixCounter::new(),
            sparse: SparseUpdateSet::new(),
            updated_params: HashSet::new(),
            next_round: 0,
        }
    }

    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    pub fn suffix_counter(&self) -> &TrainerSuffixCounter {
        &self.suffixes
    }

    pub fn sparse_updates(&self) -> &SparseUpdateSet {
        &self.sparse
    }

    /// Start a round with fresh transient state.
    pub fn begin_round(&mut self) -> RoundOutcome {
        self.end_round();
        let round = self.next_round;
        self.next_round += 1;
        RoundOutcome {
            round,
            ..Default::default()
        }
    }

    /// Drop this round's suffix allocations and sparse bookkeeping.
    pub fn end_round(&mut self) {
        self.suffixes.clear();
        self.sparse.clear();
        self.updated_params.clear();
    }

    /// Run one receive phase against `transport`.
    ///
    /// Returns once `fan_in` barriers have been seen or a terminate message
    /// arrives. With a `timeout`, gives up with [`Error::Timeout`] if the
    /// phase has not finished in time.
    pub async fn drain<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        store: &mut VariableStore,
        timeout: Option<Duration>,
    ) -> Result<RoundOutcome> {
        let mut outcome = self.begin_round();
        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));

        loop {
            let msg = match deadline {
                Some((at, limit)) => tokio::time::timeout_at(at, transport.pull())
                    .await
                    .map_err(|_| Error::Timeout {
                        phase: "barriers",
                        after_ms: limit.as_millis() as u64,
                    })??,
                None => transport.pull().await?,
            };

            match self.classify(msg, store, &mut outcome) {
                RoundStep::Continue => {}
                RoundStep::Complete => break,
                RoundStep::Terminate => {
                    transport.begin_shutdown();
                    break;
                }
            }
        }

        debug!(
            round = outcome.round,
            received = outcome.received,
            updated = outcome.updated,
            "recv {} variables for one barrier",
            outcome.received
        );
        Ok(outcome)
    }

    /// Route one message.
    pub fn classify(
        &mut self,
        msg: GradientMessage,
        store: &mut VariableStore,
        outcome: &mut RoundOutcome,
    ) -> RoundStep {
        match msg.kind {
            MessageKind::Terminate => {
                info!(round = outcome.round, "received terminate message and exit");
                outcome.terminated = true;
                RoundStep::Terminate
            }
            MessageKind::Barrier => {
                outcome.barriers += 1;
                debug!(
                    round = outcome.round,
                    barriers = outcome.barriers,
                    fan_in = self.fan_in,
                    "recv batch barrier message"
                );
                if outcome.barriers >= self.fan_in {
                    RoundStep::Complete
                } else {
                    RoundStep::Continue
                }
            }
            MessageKind::Data => {
                outcome.received += 1;
                let mut var_name = msg.name;

                if let Some(param) = self.mapping.param_for(&var_name) {
                    debug!(grad = %var_name, param, "received grad");
                    self.updated_params.insert(param.to_string());
                    outcome.updated = self.updated_params.len();
                    if self.fan_in > 1 {
                        var_name = self.suffixes.next_name(&var_name);
                    }
                } else {
                    debug!(name = %var_name, "received variable, no need to update param");
                }

                match store.deserialize_into(&var_name, &msg.payload) {
                    Ok(VarKind::SparseRows) => self.sparse.insert(var_name),
                    Ok(VarKind::Dense) => {}
                    Err(err) => {
                        error!(
                            round = outcome.round,
                            name = %var_name,
                            error = %err,
                            "rejecting variable"
                        );
                        outcome.rejected += 1;
                    }
                }
                RoundStep::Continue
            }
        }
    }
}
