//! Test case sources.
//!
//! The mutation engine is pluggable behind [`TestCaseSource`]. The built-in
//! [`PortmapNullModel`] is a deterministic boundary-value walk over a Sun RPC
//! `PMAPPROC_NULL` call, enough to drive the lifecycle against a portmapper.

use tracing::debug;
use vxfuzz_common::TestCase;

/// Supplies numbered payloads and consumes per-test failures.
pub trait TestCaseSource {
    /// Next test case, or `None` when the model is exhausted.
    fn next_case(&mut self) -> Option<TestCase>;

    /// A test ended in a crash or a transport failure.
    fn record_failure(&mut self, test_number: u64, reason: &str);

    /// Number of cases this source will produce, if known.
    fn total(&self) -> Option<u64> {
        None
    }
}

/// RPC header fields in wire order, with their template values.
const RPC_HEADER: [(&str, u32); 10] = [
    ("xid", 1),
    ("message_type", 0),
    ("rpc_version", 2),
    ("program", 100_000),
    ("program_version", 2),
    ("procedure", 0),
    ("credential_flavor", 0),
    ("credential_length", 0),
    ("verifier_flavor", 0),
    ("verifier_length", 0),
];

/// Byte length of the RPC header, carried in the fragment header.
const RPC_HEADER_LEN: u32 = (RPC_HEADER.len() * 4) as u32;

/// Values every field is walked through.
const BOUNDARY_VALUES: [u32; 14] = [
    0,
    1,
    0x7f,
    0x80,
    0xff,
    0x100,
    0x7fff,
    0x8000,
    0xffff,
    0x1_0000,
    0x7fff_ffff,
    0x8000_0000,
    0xffff_fffe,
    0xffff_ffff,
];

/// One field of the template: index 0 is the fragment header.
fn field(index: usize) -> (&'static str, u32) {
    if index == 0 {
        ("fragment_header", RPC_HEADER_LEN)
    } else {
        RPC_HEADER[index - 1]
    }
}

const FIELD_COUNT: usize = RPC_HEADER.len() + 1;

/// `PMAPPROC_NULL` template followed by single-field boundary mutations.
///
/// Test 0 is the unmutated template. Mutations skip values equal to the
/// field's template value so every later test differs from test 0.
#[derive(Debug, Default)]
pub struct PortmapNullModel {
    /// (field index, boundary index) of the next mutation.
    cursor: Option<(usize, usize)>,
    started: bool,
    next_number: u64,
    failures: Vec<(u64, String)>,
}

impl PortmapNullModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unmutated request.
    pub fn template() -> Vec<u8> {
        Self::encode(None)
    }

    /// Failures recorded so far, in test order.
    pub fn failures(&self) -> &[(u64, String)] {
        &self.failures
    }

    fn encode(mutation: Option<(usize, u32)>) -> Vec<u8> {
        let mut payload = Vec::with_capacity(FIELD_COUNT * 4);
        for index in 0..FIELD_COUNT {
            let value = match mutation {
                Some((target, value)) if target == index => value,
                _ => field(index).1,
            };
            payload.extend_from_slice(&value.to_be_bytes());
        }
        payload
    }

    /// Advance to the next (field, value) pair that differs from the template.
    fn advance(&mut self) -> Option<(usize, u32)> {
        let (mut f, mut b) = match self.cursor {
            Some(pos) => pos,
            None => (0, 0),
        };
        while f < FIELD_COUNT {
            while b < BOUNDARY_VALUES.len() {
                let value = BOUNDARY_VALUES[b];
                b += 1;
                if value != field(f).1 {
                    self.cursor = Some((f, b));
                    return Some((f, value));
                }
            }
            f += 1;
            b = 0;
        }
        self.cursor = Some((FIELD_COUNT, 0));
        None
    }
}

impl TestCaseSource for PortmapNullModel {
    fn next_case(&mut self) -> Option<TestCase> {
        let payload = if !self.started {
            self.started = true;
            debug!("Test {}: PMAPPROC_NULL template", self.next_number);
            Self::template()
        } else {
            let (index, value) = self.advance()?;
            debug!(
                "Test {}: {} = {:#010x}",
                self.next_number,
                field(index).0,
                value
            );
            Self::encode(Some((index, value)))
        };
        let number = self.next_number;
        self.next_number += 1;
        Some(TestCase { number, payload })
    }

    fn record_failure(&mut self, test_number: u64, reason: &str) {
        self.failures.push((test_number, reason.to_string()));
    }

    fn total(&self) -> Option<u64> {
        let mutations: usize = (0..FIELD_COUNT)
            .map(|f| {
                BOUNDARY_VALUES
                    .iter()
                    .filter(|v| **v != field(f).1)
                    .count()
            })
            .sum();
        Some(1 + mutations as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn dword(payload: &[u8], index: usize) -> u32 {
        let bytes: [u8; 4] = payload[index * 4..index * 4 + 4].try_into().unwrap();
        u32::from_be_bytes(bytes)
    }

    #[test]
    fn test_template_layout() {
        let payload = PortmapNullModel::template();
        assert_eq!(payload.len(), 44);
        assert_eq!(dword(&payload, 0), 40);
        assert_eq!(dword(&payload, 1), 1);
        assert_eq!(dword(&payload, 3), 2);
        assert_eq!(dword(&payload, 4), 100_000);
        assert_eq!(dword(&payload, 5), 2);
        assert!((6..11).all(|i| dword(&payload, i) == 0));
    }

    #[test]
    fn test_first_case_is_template() {
        let mut model = PortmapNullModel::new();
        let first = model.next_case().unwrap();
        assert_eq!(first.number, 0);
        assert_eq!(first.payload, PortmapNullModel::template());
    }

    #[test]
    fn test_walk_is_complete_and_distinct() {
        let mut model = PortmapNullModel::new();
        let total = model.total().unwrap();
        let template = PortmapNullModel::template();

        let mut payloads = HashSet::new();
        let mut count = 0u64;
        while let Some(case) = model.next_case() {
            assert_eq!(case.number, count);
            assert_eq!(case.payload.len(), template.len());
            if case.number > 0 {
                let changed = (0..FIELD_COUNT)
                    .filter(|&i| dword(&case.payload, i) != dword(&template, i))
                    .count();
                assert_eq!(changed, 1, "test {} mutates one field", case.number);
            }
            assert!(payloads.insert(case.payload));
            count += 1;
        }
        assert_eq!(count, total);
        assert!(model.next_case().is_none());
    }

    #[test]
    fn test_record_failure() {
        let mut model = PortmapNullModel::new();
        model.record_failure(7, "crash");
        assert_eq!(model.failures(), &[(7, "crash".to_string())]);
    }
}
