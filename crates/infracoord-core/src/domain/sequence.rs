//! SequenceIssuer - 単調増加する InstanceId の発行
//!
//! The epoch is fixed for the lifetime of one coordinator run. Ids issued
//! within an epoch step by [`SEQUENCE_NUMBER_STRIDE`]; a larger epoch resets
//! the counter.

use std::sync::{Arc, Mutex, PoisonError};

use super::errors::CoordinatorError;
use super::ids::InstanceId;

pub const SEQUENCE_NUMBER_STRIDE: u32 = 4;

#[derive(Debug, Default)]
pub struct SequenceIssuer {
    epoch: Option<i32>,
    // Counter of the last issued id. Counter 0 is never handed out, so
    // `InstanceId::ZERO` can stand for "no task".
    counter: u64,
}

impl SequenceIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> Option<i32> {
        self.epoch
    }

    /// Fix the epoch for the next run.
    ///
    /// # Errors
    /// - negative epoch
    /// - epoch smaller than the one previously observed
    pub fn begin_epoch(&mut self, epoch: i32) -> Result<(), CoordinatorError> {
        if epoch < 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "primary epoch must be non-negative, got {epoch}"
            )));
        }
        match self.epoch {
            Some(previous) if epoch < previous => Err(CoordinatorError::InvalidArgument(format!(
                "primary epoch must not decrease (previous {previous}, new {epoch})"
            ))),
            Some(previous) if epoch == previous => Ok(()),
            _ => {
                self.epoch = Some(epoch);
                self.counter = 0;
                Ok(())
            }
        }
    }

    /// Next id, without consuming it.
    ///
    /// # Errors
    /// - the counter no longer fits the low 32 bits of an id
    pub fn peek(&self) -> Result<InstanceId, CoordinatorError> {
        let epoch = self.epoch.unwrap_or(0);
        let next = self.counter + u64::from(SEQUENCE_NUMBER_STRIDE);
        let counter = u32::try_from(next).map_err(|_| {
            CoordinatorError::InvalidOperation(format!(
                "instance id counter exhausted for epoch {epoch}"
            ))
        })?;
        Ok(InstanceId::from_parts(epoch, counter))
    }

    pub fn issue(&mut self) -> Result<InstanceId, CoordinatorError> {
        let id = self.peek()?;
        self.counter += u64::from(SEQUENCE_NUMBER_STRIDE);
        Ok(id)
    }
}

/// Issuer shared by the coordinator and the command processor.
#[derive(Debug, Clone, Default)]
pub struct SharedSequenceIssuer(Arc<Mutex<SequenceIssuer>>);

impl SharedSequenceIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_epoch(&self, epoch: i32) -> Result<(), CoordinatorError> {
        self.lock().begin_epoch(epoch)
    }

    pub fn peek(&self) -> Result<InstanceId, CoordinatorError> {
        self.lock().peek()
    }

    pub fn issue(&self) -> Result<InstanceId, CoordinatorError> {
        self.lock().issue()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SequenceIssuer> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
