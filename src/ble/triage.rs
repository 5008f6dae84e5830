//! Advertisement triage - decides whether an advertiser is worth a
//! connection.
//!
//! A report qualifies when it is connectable and discoverable, carries the
//! expected local name, embeds a recognised status record, and that record
//! says there is something to do: logs waiting, or a peripheral clock from
//! a different year than ours (treated as a clock needing a resync).

use chrono::{Datelike, NaiveDateTime};
use tracing::trace;

use super::adv_parser::name_matches;
use super::{AddressType, BdAddr, ReportFlags};
use crate::proto::{decode_advertisement_status, AdvertisementStatus};

/// Peripheral selected for a connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub address: BdAddr,
    pub address_type: AddressType,
    pub status: AdvertisementStatus,
}

impl Candidate {
    pub fn pending_log_count(&self) -> u16 {
        self.status.pending_log_count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    NotConnectable,
    NameMismatch,
    Unrecognized,
    NothingToDo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Connect(Candidate),
    Reject(RejectReason),
}

/// Stateless filter over advertisement reports.
#[derive(Clone, Debug)]
pub struct AdvertisementTriage {
    device_name: String,
}

impl AdvertisementTriage {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }

    pub fn evaluate(
        &self,
        address: BdAddr,
        address_type: AddressType,
        flags: ReportFlags,
        payload: &[u8],
        now: NaiveDateTime,
    ) -> Verdict {
        let verdict = self.classify(address, address_type, flags, payload, now);
        if let Verdict::Reject(reason) = verdict {
            trace!(%address, ?reason, "advertisement rejected");
        }
        verdict
    }

    fn classify(
        &self,
        address: BdAddr,
        address_type: AddressType,
        flags: ReportFlags,
        payload: &[u8],
        now: NaiveDateTime,
    ) -> Verdict {
        if !flags.contains(ReportFlags::CONNECTABLE | ReportFlags::DISCOVERABLE) {
            return Verdict::Reject(RejectReason::NotConnectable);
        }
        if !name_matches(payload, &self.device_name) {
            return Verdict::Reject(RejectReason::NameMismatch);
        }
        let Some(status) = decode_advertisement_status(payload) else {
            return Verdict::Reject(RejectReason::Unrecognized);
        };

        let clock_stale = status.last_known_time.year() != now.year();
        if status.pending_log_count == 0 && !clock_stale {
            return Verdict::Reject(RejectReason::NothingToDo);
        }

        Verdict::Connect(Candidate {
            address,
            address_type,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::status::STATUS_RECORD_SIZE;
    use chrono::NaiveDate;

    const ADDR: BdAddr = BdAddr([0x00, 0x0B, 0x57, 0x01, 0x02, 0x03]);

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 15)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap()
    }

    fn advertisement(name: &[u8], year: u8, pending: u16) -> Vec<u8> {
        let mut payload = vec![0x02, 0x01, 0x06];
        payload.push(name.len() as u8 + 1);
        payload.push(0x09);
        payload.extend_from_slice(name);
        payload.push(1 + 2 + STATUS_RECORD_SIZE as u8);
        payload.extend_from_slice(&[0xFF, 0xFF, 0x02]);
        payload.extend_from_slice(&[0x01, year, 10, 1, 8, 0, 0, 70, 0, 1, 0]);
        payload.extend_from_slice(&pending.to_le_bytes());
        payload
    }

    fn both() -> ReportFlags {
        ReportFlags::CONNECTABLE | ReportFlags::DISCOVERABLE
    }

    fn triage() -> AdvertisementTriage {
        AdvertisementTriage::new("PRX")
    }

    #[test]
    fn current_clock_and_no_logs_is_rejected() {
        let verdict = triage().evaluate(ADDR, AddressType::Public, both(), &advertisement(b"PRX", 26, 0), now());
        assert_eq!(verdict, Verdict::Reject(RejectReason::NothingToDo));
    }

    #[test]
    fn pending_logs_are_accepted() {
        let verdict = triage().evaluate(ADDR, AddressType::Public, both(), &advertisement(b"PRX", 26, 3), now());
        match verdict {
            Verdict::Connect(candidate) => {
                assert_eq!(candidate.address, ADDR);
                assert_eq!(candidate.pending_log_count(), 3);
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[test]
    fn stale_clock_is_accepted_without_logs() {
        let verdict = triage().evaluate(ADDR, AddressType::Public, both(), &advertisement(b"PRX", 25, 0), now());
        assert!(matches!(verdict, Verdict::Connect(c) if c.pending_log_count() == 0));
    }

    #[test]
    fn missing_flag_bits_are_rejected_first() {
        let payload = advertisement(b"PRX", 26, 3);
        for flags in [ReportFlags(0), ReportFlags::CONNECTABLE, ReportFlags::DISCOVERABLE] {
            assert_eq!(
                triage().evaluate(ADDR, AddressType::Public, flags, &payload, now()),
                Verdict::Reject(RejectReason::NotConnectable)
            );
        }
    }

    #[test]
    fn other_names_are_rejected() {
        let verdict = triage().evaluate(ADDR, AddressType::Public, both(), &advertisement(b"PRY", 26, 3), now());
        assert_eq!(verdict, Verdict::Reject(RejectReason::NameMismatch));
    }

    #[test]
    fn name_without_status_is_unrecognized() {
        let payload = [0x02, 0x01, 0x06, 0x04, 0x09, b'P', b'R', b'X'];
        let verdict = triage().evaluate(ADDR, AddressType::Public, both(), &payload, now());
        assert_eq!(verdict, Verdict::Reject(RejectReason::Unrecognized));
    }
}
