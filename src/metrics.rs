//! Counters exported through the `metrics` facade.
//!
//! Nothing is recorded unless the application installs a recorder.

use metrics::counter;

pub const ITEMS_ACCEPTED: &str = "fanweld_items_accepted_total";
pub const ITEMS_PROCESSED: &str = "fanweld_items_processed_total";
pub const ITEMS_FAILED: &str = "fanweld_items_failed_total";
pub const ITEMS_STUCK: &str = "fanweld_items_stuck_total";
pub const ERROR_RECORDS_DROPPED: &str = "fanweld_error_records_dropped_total";
pub const SUBMIT_BACKPRESSURE: &str = "fanweld_submit_backpressure_total";

pub(crate) fn item_accepted() {
    counter!(ITEMS_ACCEPTED).increment(1);
}

pub(crate) fn item_processed(succeeded: bool) {
    counter!(ITEMS_PROCESSED).increment(1);
    if !succeeded {
        counter!(ITEMS_FAILED).increment(1);
    }
}

pub(crate) fn item_stuck() {
    counter!(ITEMS_STUCK).increment(1);
}

pub(crate) fn error_record_dropped() {
    counter!(ERROR_RECORDS_DROPPED).increment(1);
}

pub(crate) fn submit_backpressure() {
    counter!(SUBMIT_BACKPRESSURE).increment(1);
}
