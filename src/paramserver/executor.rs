//! Update programs run once per round against the aggregated state.

use crate::core::Error;
use crate::paramserver::config::ServerConfig;
use crate::paramserver::round::trainer_var_name;
use crate::paramserver::variable::{VarKind, Variable, VariableStore};
use std::ops::Range;
use thiserror::Error;

/// Errors raised by an update program.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Unknown optimize block: {0}")]
    UnknownBlock(String),

    #[error("Missing variable: {0}")]
    MissingVariable(String),

    #[error("Shape mismatch for {name}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Variable {name} has unsupported kind {kind} for this program")]
    UnsupportedKind { name: String, kind: VarKind },

    #[error("{0}")]
    Failed(String),
}

impl From<UpdateError> for Error {
    fn from(err: UpdateError) -> Self {
        Error::UpdateExecutionFailure(err.to_string())
    }
}

/// Capability to run the update computation for a round.
pub trait UpdateExecutor: Send {
    /// Run program `block_id` against the server-side variables.
    fn run(&mut self, store: &mut VariableStore, block_id: &str) -> Result<(), UpdateError>;
}

impl<F> UpdateExecutor for F
where
    F: FnMut(&mut VariableStore, &str) -> Result<(), UpdateError> + Send,
{
    fn run(&mut self, store: &mut VariableStore, block_id: &str) -> Result<(), UpdateError> {
        self(store, block_id)
    }
}

/// Plain SGD over merged trainer gradients.
///
/// For each (param, grad) pair the gradient copies written this round are
/// averaged: `grad` itself with one trainer, otherwise whichever of
/// `grad.trainer_0..fan_in` arrived. A parameter with no fresh copy is left
/// alone. Sparse-row copies contribute only their listed rows.
#[derive(Clone, Debug)]
pub struct SgdProgram {
    block_id: String,
    learning_rate: f32,
    fan_in: usize,
    pairs: Vec<(String, String)>,
}

impl SgdProgram {
    pub fn new(
        block_id: &str,
        learning_rate: f32,
        fan_in: usize,
        pairs: &[(&str, &str)],
    ) -> Self {
        Self {
            block_id: block_id.to_string(),
            learning_rate,
            fan_in: fan_in.max(1),
            pairs: pairs
                .iter()
                .map(|(p, g)| (p.to_string(), g.to_string()))
                .collect(),
        }
    }

    /// Program over every (param, grad) pair in the configuration.
    pub fn from_config(config: &ServerConfig, learning_rate: f32) -> Self {
        Self {
            block_id: config.optimize_block_id.clone(),
            learning_rate,
            fan_in: config.fan_in.max(1),
            pairs: config
                .param_list
                .iter()
                .cloned()
                .zip(config.grad_list.iter().cloned())
                .collect(),
        }
    }

    fn sources(&self, store: &VariableStore, grad: &str) -> Vec<String> {
        let candidates = if self.fan_in > 1 {
            (0..self.fan_in).map(|k| trainer_var_name(grad, k)).collect()
        } else {
            vec![grad.to_string()]
        };
        candidates
            .into_iter()
            .filter(|name| store.is_written(name))
            .collect()
    }

    /// Average of this round's copies of `grad`, or `None` if none arrived.
    fn merge(
        &self,
        store: &VariableStore,
        grad: &str,
        numel: usize,
        width: usize,
    ) -> Result<Option<Vec<f32>>, UpdateError> {
        let sources = self.sources(store, grad);
        if sources.is_empty() {
            return Ok(None);
        }
        let mut merged = vec![0.0f32; numel];

        for source in &sources {
            match store.get(source) {
                None => return Err(UpdateError::MissingVariable(source.clone())),
                Some(Variable::Dense(t)) => {
                    if t.numel() != numel {
                        return Err(UpdateError::ShapeMismatch {
                            name: source.clone(),
                            expected: numel,
                            actual: t.numel(),
                        });
                    }
                    for (m, g) in merged.iter_mut().zip(&t.data) {
                        *m += g;
                    }
                }
                Some(Variable::SparseRows(s)) => {
                    if !s.rows.is_empty() && s.value.row_width() != width {
                        return Err(UpdateError::ShapeMismatch {
                            name: source.clone(),
                            expected: width,
                            actual: s.value.row_width(),
                        });
                    }
                    for (i, row) in s.rows.iter().enumerate() {
                        let dst = usize::try_from(*row)
                            .ok()
                            .and_then(|r| row_span(r, width, numel))
                            .ok_or_else(|| {
                                UpdateError::Failed(format!(
                                    "row {} of {} outside parameter",
                                    row, source
                                ))
                            })?;
                        let src = row_span(i, width, s.value.data.len())
                            .and_then(|span| s.value.data.get(span))
                            .ok_or_else(|| {
                                UpdateError::Failed(format!(
                                    "value of {} is missing row {}",
                                    source, i
                                ))
                            })?;
                        for (m, g) in merged[dst].iter_mut().zip(src) {
                            *m += g;
                        }
                    }
                }
            }
        }

        let scale = 1.0 / sources.len() as f32;
        merged.iter_mut().for_each(|m| *m *= scale);
        Ok(Some(merged))
    }
}

/// Element range of row `row` in a buffer of `len` elements.
fn row_span(row: usize, width: usize, len: usize) -> Option<Range<usize>> {
    let start = row.checked_mul(width)?;
    let end = start.checked_add(width)?;
    (end <= len).then_some(start..end)
}

impl UpdateExecutor for SgdProgram {
    fn run(&mut self, store: &mut VariableStore, block_id: &str) -> Result<(), UpdateError> {
        if block_id != self.block_id {
            return Err(UpdateError::UnknownBlock(block_id.to_string()));
        }

        for (param, grad) in &self.pairs {
            let (numel, width) = match store.get(param) {
                Some(Variable::Dense(t)) => (t.numel(), t.row_width()),
                Some(other) => {
                    return Err(UpdateError::UnsupportedKind {
                        name: param.clone(),
                        kind: other.kind(),
                    })
                }
                None => return Err(UpdateError::MissingVariable(param.clone())),
            };

            let Some(merged) = self.merge(store, grad, numel, width)? else {
                continue;
            };

            if let Some(Variable::Dense(t)) = store.get_mut(param) {
                for (p, g) in t.data.iter_mut().zip(&merged) {
                    *p -= self.learning_rate * g;
                }
            }
        }
        Ok(())
    }
}
