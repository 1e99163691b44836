//! Relay tuning constants and message-type ranges
//!
//! This module contains the framing constants for the ring buffer record
//! format, the partition of the message-type id space into application and
//! administrative ranges, and the default tuning values used by the
//! pipeline configuration.

use std::time::Duration;

/// Alignment of every record placed in a ring buffer, in bytes
pub const RECORD_ALIGNMENT: usize = 8;

/// Length of the record header (i32 record length + i32 message-type id)
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Message-type id of the padding record written at end-of-buffer when the
/// next record would straddle the wrap point
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Message-type id used for application records entering the pipeline
pub const APPLICATION_MSG_TYPE_ID: i32 = 1;

/// First message-type id of the administrative range
pub const ADMINISTRATIVE_MSG_TYPE_BASE: i32 = 0x7f00_0000;

/// Message-type id carried by snapshot marker records
pub const ADMINISTRATIVE_MSG_TYPE_ID: i32 = 0x7f00_0001;

/// Default capacity of the pipeline rings (data region, excluding the
/// cursor trailer)
pub const DEFAULT_RING_CAPACITY: usize = 16 * 1024;

/// Maximum transport fragments processed per ingress poll iteration
pub const DEFAULT_FRAME_COUNT_LIMIT: usize = 10;

/// Records drained from an output ring per egress poll iteration
pub const EGRESS_BATCH_LIMIT: usize = 8;

/// Records consumed per poll iteration by the intermediate and service stages
pub const STAGE_BATCH_LIMIT: usize = 16;

/// Default timing wheel tick duration
pub const DEFAULT_TICK_DURATION: Duration = Duration::from_micros(100);

/// Default number of timing wheel spokes (must be a power of 2)
pub const DEFAULT_TICKS_PER_WHEEL: usize = 512;

/// Default interval between injected save-snapshot markers
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Markers the timer may leave pending for the ingress worker before new
/// ones are dropped
pub const MARKER_QUEUE_LIMIT: usize = 64;

/// Default node identifier carried in administrative message bodies
pub const DEFAULT_NODE_ID: u16 = 0;

/// True when the message-type id falls in the administrative range
#[inline]
pub fn is_administrative(msg_type_id: i32) -> bool {
    msg_type_id >= ADMINISTRATIVE_MSG_TYPE_BASE
}

/// Validate that the constants are consistent with each other
pub fn validate_constants() -> Result<(), &'static str> {
    if !RECORD_ALIGNMENT.is_power_of_two() {
        return Err("RECORD_ALIGNMENT must be a power of 2");
    }
    if RECORD_HEADER_LENGTH % RECORD_ALIGNMENT != 0 {
        return Err("RECORD_HEADER_LENGTH must be record aligned");
    }
    if !DEFAULT_RING_CAPACITY.is_power_of_two() {
        return Err("DEFAULT_RING_CAPACITY must be a power of 2");
    }
    if !DEFAULT_TICKS_PER_WHEEL.is_power_of_two() {
        return Err("DEFAULT_TICKS_PER_WHEEL must be a power of 2");
    }
    if APPLICATION_MSG_TYPE_ID <= 0 || APPLICATION_MSG_TYPE_ID >= ADMINISTRATIVE_MSG_TYPE_BASE {
        return Err("APPLICATION_MSG_TYPE_ID must be positive and below the administrative range");
    }
    if ADMINISTRATIVE_MSG_TYPE_ID < ADMINISTRATIVE_MSG_TYPE_BASE {
        return Err("ADMINISTRATIVE_MSG_TYPE_ID must lie in the administrative range");
    }
    if DEFAULT_FRAME_COUNT_LIMIT == 0 || EGRESS_BATCH_LIMIT == 0 || STAGE_BATCH_LIMIT == 0 {
        return Err("batch limits must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_validation() {
        assert!(validate_constants().is_ok());
    }

    #[test]
    fn test_type_id_partition() {
        assert!(!is_administrative(APPLICATION_MSG_TYPE_ID));
        assert!(!is_administrative(ADMINISTRATIVE_MSG_TYPE_BASE - 1));
        assert!(is_administrative(ADMINISTRATIVE_MSG_TYPE_BASE));
        assert!(is_administrative(ADMINISTRATIVE_MSG_TYPE_ID));
        assert!(is_administrative(i32::MAX));
    }

    #[test]
    fn test_ring_capacity_is_power_of_two() {
        assert!(DEFAULT_RING_CAPACITY.is_power_of_two());
        assert!(DEFAULT_TICKS_PER_WHEEL.is_power_of_two());
    }
}
