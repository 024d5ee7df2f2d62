//! Ordered execution of several statements on one handle.
//!
//! With `continue_on_error` unset, the first failure aborts the batch and, if
//! the batch opened a transaction, rolls back every earlier item. With it set,
//! failures are recorded per item and the batch keeps going. That mode is not
//! atomic: effects of items that succeeded stay applied.

use crate::command::{param, Command, Params, Response};
use crate::database::Database;
use crate::error::{BridgeError, ErrorEnvelope, Result};
use crate::executor::{OperationKind, Outcome};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub index: usize,
    pub command: Command,
}

impl BatchItem {
    /// Parse every operation up front so protocol errors never leave a batch
    /// half applied.
    pub fn parse_all(operations: &[JsonValue]) -> Result<Vec<BatchItem>> {
        operations
            .iter()
            .enumerate()
            .map(|(index, operation)| {
                let params = Params::from_json(operation)?;
                let method = params.required_str(param::METHOD)?;
                let kind = method
                    .parse::<OperationKind>()
                    .map_err(|_| BridgeError::UnsupportedMethod(format!("{method} in batch")))?;
                let command = Command::from_params(kind, &params)?;
                if command.options.in_transaction_change.is_some() {
                    return Err(nested_transaction_change());
                }
                Ok(BatchItem { index, command })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Success(Response),
    Failure(ErrorEnvelope),
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchResult::Success(_))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            BatchResult::Success(response) => json!({ "result": response.to_json() }),
            BatchResult::Failure(error) => json!({ "error": error }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub continue_on_error: bool,
    pub no_result: bool,
    pub in_transaction: bool,
}

/// Run `items` in order. Query items deliver all of their rows in one page;
/// with `no_result` they still execute but their rows are discarded.
pub fn run_batch(db: &mut Database, items: &[BatchItem], options: BatchOptions) -> Result<Vec<BatchResult>> {
    if options.in_transaction {
        db.begin()?;
    }

    let mut results = Vec::with_capacity(items.len());
    for item in items {
        db.log_statement_kind(item.command.kind, item.index);
        match run_item(db, &item.command, options.no_result) {
            Ok(response) => results.push(BatchResult::Success(response)),
            Err(err) if options.continue_on_error => {
                results.push(BatchResult::Failure(err.into()));
            }
            Err(err) => {
                if options.in_transaction {
                    if let Err(rollback) = db.rollback() {
                        warn!(db = db.id(), error = %rollback, "batch rollback failed");
                    }
                }
                return Err(BridgeError::BatchAborted {
                    index: item.index,
                    source: Box::new(err),
                });
            }
        }
    }

    if options.in_transaction {
        if let Err(err) = db.commit() {
            if db.in_transaction() {
                if let Err(rollback) = db.rollback() {
                    warn!(db = db.id(), error = %rollback, "batch rollback failed");
                }
            }
            return Err(err);
        }
    }
    Ok(results)
}

fn nested_transaction_change() -> BridgeError {
    BridgeError::bad_param(format!(
        "{} is not allowed inside a batch",
        param::IN_TRANSACTION_CHANGE
    ))
}

fn run_item(db: &mut Database, command: &Command, no_result: bool) -> Result<Response> {
    if command.options.in_transaction_change.is_some() {
        return Err(nested_transaction_change());
    }
    if command.kind == OperationKind::Query && !no_result {
        return db.query_all(command).map(Response::Page);
    }
    let outcome = db.run(command)?;
    if no_result {
        return Ok(Response::Done);
    }
    Ok(match outcome {
        Outcome::Executed => Response::Done,
        Outcome::Inserted(id) => Response::Inserted(id),
        Outcome::Updated(count) => Response::Updated(count),
    })
}
