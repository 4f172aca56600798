// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use num_derive::FromPrimitive;
use std::sync::atomic::{AtomicI64, Ordering::SeqCst};
use thiserror::Error;

/// What the host library was doing when the process crashed.
///
/// Each variant has a counter that the library bumps around the matching work. The crash
/// handler only loads the counters, so a report can say which operations were in progress
/// at the time of the crash.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, FromPrimitive)]
pub enum OpTypes {
    ProfilerInactive = 0,
    ProfilerCollectingSample,
    ProfilerUnwinding,
    ProfilerSerializing,
    /// Number of real variants, not an operation.
    SIZE,
}

pub const NUM_OP_TYPES: usize = OpTypes::SIZE as usize;

impl OpTypes {
    /// Key of this counter in the `counters` part. Static, so the crash handler can use it.
    pub const fn name(&self) -> &'static str {
        match self {
            OpTypes::ProfilerInactive => "profiler_inactive",
            OpTypes::ProfilerCollectingSample => "profiler_collecting_sample",
            OpTypes::ProfilerUnwinding => "profiler_unwinding",
            OpTypes::ProfilerSerializing => "profiler_serializing",
            OpTypes::SIZE => "size",
        }
    }

    pub fn from_index(i: usize) -> Result<Self, CounterError> {
        <OpTypes as num_traits::FromPrimitive>::from_usize(i)
            .filter(|op| *op != OpTypes::SIZE)
            .ok_or(CounterError::InvalidEnumValue(i))
    }
}

// Only used as an array initializer.
#[allow(clippy::declare_interior_mutable_const)]
const ATOMIC_ZERO: AtomicI64 = AtomicI64::new(0);

static OP_COUNTERS: [AtomicI64; NUM_OP_TYPES] = [ATOMIC_ZERO; NUM_OP_TYPES];

/// Records that `op` started. Fails rather than wrapping on overflow.
pub fn begin_op(op: OpTypes) -> Result<(), CounterError> {
    let counter = OP_COUNTERS
        .get(op as usize)
        .ok_or(CounterError::InvalidEnumValue(op as usize))?;
    counter
        .fetch_update(SeqCst, SeqCst, |v| v.checked_add(1))
        .map_err(|_| CounterError::CounterOverflow(op))?;
    Ok(())
}

/// Records that `op` finished. Ending an operation whose counter is zero is an error and
/// leaves the counter at zero.
pub fn end_op(op: OpTypes) -> Result<(), CounterError> {
    let counter = OP_COUNTERS
        .get(op as usize)
        .ok_or(CounterError::InvalidEnumValue(op as usize))?;
    counter
        .fetch_update(SeqCst, SeqCst, |v| (v > 0).then(|| v - 1))
        .map_err(|_| CounterError::OperationNotStarted(op))?;
    Ok(())
}

/// Copies the current value of every counter.
/// ATOMICITY:
///     Each load is atomic; the snapshot as a whole is not.
/// SIGNAL SAFETY:
///     Only atomic loads, no allocation.
pub fn snapshot_counters() -> [i64; NUM_OP_TYPES] {
    let mut values = [0; NUM_OP_TYPES];
    for (value, counter) in values.iter_mut().zip(OP_COUNTERS.iter()) {
        *value = counter.load(SeqCst);
    }
    values
}

/// Zeroes every counter. Meant for a freshly forked child, before it starts any operation of
/// its own: concurrent `begin_op`/`end_op` calls may be lost.
pub fn reset_counters() {
    for c in OP_COUNTERS.iter() {
        c.store(0, SeqCst);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CounterError {
    #[error("No operation with index {0}")]
    InvalidEnumValue(usize),
    #[error("Counter for {0:?} overflowed")]
    CounterOverflow(OpTypes),
    #[error("Ended {0:?} more times than it was started")]
    OperationNotStarted(OpTypes),
}

#[cfg(test)]
pub(crate) static COUNTER_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_end_snapshot() {
        let _guard = COUNTER_TEST_LOCK.lock().unwrap();
        reset_counters();
        begin_op(OpTypes::ProfilerCollectingSample).unwrap();
        begin_op(OpTypes::ProfilerCollectingSample).unwrap();
        begin_op(OpTypes::ProfilerUnwinding).unwrap();
        end_op(OpTypes::ProfilerCollectingSample).unwrap();

        assert_eq!(snapshot_counters(), [0, 1, 1, 0]);

        reset_counters();
        assert_eq!(snapshot_counters(), [0; NUM_OP_TYPES]);
    }

    #[test]
    fn test_end_without_begin() {
        let _guard = COUNTER_TEST_LOCK.lock().unwrap();
        reset_counters();
        assert_eq!(
            end_op(OpTypes::ProfilerSerializing),
            Err(CounterError::OperationNotStarted(OpTypes::ProfilerSerializing))
        );
        // A failed end must not drive the counter negative
        assert_eq!(snapshot_counters()[OpTypes::ProfilerSerializing as usize], 0);
    }

    #[test]
    fn test_names() {
        assert_eq!(OpTypes::from_index(0).unwrap().name(), "profiler_inactive");
        assert_eq!(
            OpTypes::from_index(3).unwrap(),
            OpTypes::ProfilerSerializing
        );
        assert_eq!(
            OpTypes::from_index(NUM_OP_TYPES),
            Err(CounterError::InvalidEnumValue(NUM_OP_TYPES))
        );
    }
}
