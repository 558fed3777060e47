//! Outstanding management requests waiting for their confirm.

use heapless::Vec;

use super::primitives::{EventStatus, MlmeType};

/// Number of management requests that may be outstanding at once.
pub const CONFIRM_QUEUE_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    Full,
    /// A request of this type is already outstanding.
    Duplicate,
}

/// One outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfirmEntry {
    #[allow(missing_docs)]
    pub request: MlmeType,
    #[allow(missing_docs)]
    pub status: EventStatus,
    /// The confirm can be delivered.
    pub ready: bool,
    /// The entry is completed by its own event only, never by the status of the whole cycle.
    pub restrict_common_ready: bool,
}

/// Fixed capacity queue with at most one entry per request type.
#[derive(Debug, Clone)]
pub struct ConfirmQueue {
    entries: Vec<ConfirmEntry, CONFIRM_QUEUE_LEN>,
    common_status: EventStatus,
}

impl Default for ConfirmQueue {
    fn default() -> Self {
        Self { entries: Vec::new(), common_status: EventStatus::Error }
    }
}

impl ConfirmQueue {
    /// Track a new request. Duplicate types are rejected, never overwritten.
    pub fn add(&mut self, request: MlmeType, restrict_common_ready: bool) -> Result<(), Error> {
        if self.is_active(request) {
            return Err(Error::Duplicate);
        }
        self.entries
            .push(ConfirmEntry { request, status: EventStatus::Error, ready: false, restrict_common_ready })
            .map_err(|_| Error::Full)
    }

    /// Remove the oldest entry.
    pub fn remove_first(&mut self) -> Option<ConfirmEntry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Remove the newest entry, undoing an `add` whose request could not be started.
    pub fn remove_last(&mut self) -> Option<ConfirmEntry> {
        self.entries.pop()
    }

    /// Complete the entry of a request type. Returns `false` when none is outstanding.
    pub fn set_status(&mut self, request: MlmeType, status: EventStatus) -> bool {
        match self.entries.iter_mut().find(|entry| entry.request == request) {
            Some(entry) => {
                entry.status = status;
                entry.ready = true;
                true
            }
            None => false,
        }
    }

    /// Status of an outstanding request.
    pub fn status(&self, request: MlmeType) -> Option<EventStatus> {
        self.entries.iter().find(|entry| entry.request == request).map(|entry| entry.status)
    }

    /// Complete every entry that follows the status of the whole cycle.
    pub fn set_common_status(&mut self, status: EventStatus) {
        self.common_status = status;
        for entry in self.entries.iter_mut().filter(|entry| !entry.restrict_common_ready) {
            entry.status = status;
            entry.ready = true;
        }
    }

    /// Status last applied to all entries.
    pub fn common_status(&self) -> EventStatus {
        self.common_status
    }

    /// Is a request of this type outstanding?
    pub fn is_active(&self, request: MlmeType) -> bool {
        self.entries.iter().any(|entry| entry.request == request)
    }

    /// Remove the oldest completed entry.
    pub fn pop_ready(&mut self) -> Option<ConfirmEntry> {
        let index = self.entries.iter().position(|entry| entry.ready)?;
        Some(self.entries.remove(index))
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[allow(missing_docs)]
    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_type_is_rejected() {
        let mut queue = ConfirmQueue::default();
        queue.add(MlmeType::LinkCheck, false).unwrap();
        assert_eq!(queue.add(MlmeType::LinkCheck, false), Err(Error::Duplicate));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut queue = ConfirmQueue::default();
        for request in [
            MlmeType::Join,
            MlmeType::LinkCheck,
            MlmeType::DeviceTime,
            MlmeType::PingSlotInfo,
            MlmeType::BeaconAcquisition,
        ] {
            queue.add(request, false).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.add(MlmeType::TxCw, false), Err(Error::Full));
        assert_eq!(queue.remove_first().map(|e| e.request), Some(MlmeType::Join));
        assert_eq!(queue.remove_last().map(|e| e.request), Some(MlmeType::BeaconAcquisition));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn common_status_skips_restricted_entries() {
        let mut queue = ConfirmQueue::default();
        queue.add(MlmeType::LinkCheck, false).unwrap();
        queue.add(MlmeType::BeaconAcquisition, true).unwrap();
        queue.set_common_status(EventStatus::Rx2Timeout);
        assert_eq!(queue.common_status(), EventStatus::Rx2Timeout);
        let entry = queue.pop_ready().unwrap();
        assert_eq!(entry.request, MlmeType::LinkCheck);
        assert_eq!(entry.status, EventStatus::Rx2Timeout);
        assert!(queue.pop_ready().is_none());
        assert!(queue.is_active(MlmeType::BeaconAcquisition));
        assert!(queue.set_status(MlmeType::BeaconAcquisition, EventStatus::BeaconNotFound));
        assert_eq!(queue.status(MlmeType::BeaconAcquisition), Some(EventStatus::BeaconNotFound));
        assert_eq!(queue.pop_ready().map(|e| e.status), Some(EventStatus::BeaconNotFound));
        assert!(queue.is_empty());
        assert!(!queue.set_status(MlmeType::Join, EventStatus::Ok));
    }
}
