//! Negentropy set reconciliation (NIP-77)
//!
//! Binary codec for Negentropy Protocol V1 messages (varints, bounds,
//! ranges, fingerprints) plus the server-side reconciliation state machine
//! driven by NEG-OPEN / NEG-MSG frames. Messages travel hex-encoded inside
//! the JSON frames; this module deals in the raw bytes.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Nip77Error {
    #[error("unsupported protocol version: {0:#04x}")]
    BadVersion(u8),

    #[error("unknown range mode: {0}")]
    BadMode(u64),

    #[error("invalid hex: {0}")]
    BadHex(String),

    #[error("bad varint: {0}")]
    BadVarint(String),

    #[error("bad bound: {0}")]
    BadBound(String),

    #[error("truncated message")]
    Truncated,
}

type Result<T> = std::result::Result<T, Nip77Error>;

/// Negentropy Protocol Version 1
pub const PROTOCOL_VERSION_1: u8 = 0x61;

/// Sentinel timestamp for the upper infinity bound
pub const TIMESTAMP_INFINITY: u64 = u64::MAX;

/// A 256-bit event id
pub type EventId = [u8; 32];

/// Encode a varint: base-128 digits, most significant first, high bit set
/// on every byte but the last.
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut digits = [0u8; 10];
    let mut n = 0;
    let mut v = value;
    loop {
        digits[n] = (v & 0x7f) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }

    let mut out = Vec::with_capacity(n);
    for i in (0..n).rev() {
        let mut byte = digits[i];
        if i != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

/// Decode a varint, returning (value, bytes consumed).
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            return Err(Nip77Error::BadVarint("longer than 10 bytes".to_string()));
        }
        if value > (u64::MAX >> 7) {
            return Err(Nip77Error::BadVarint("overflow".to_string()));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Nip77Error::BadVarint("incomplete".to_string()))
}

/// A (timestamp, id-prefix) bound delimiting ranges.
///
/// Timestamps are delta-encoded against the previous bound in the message;
/// the on-wire value 0 means infinity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub timestamp: u64,
    pub id_prefix: Vec<u8>,
}

impl Bound {
    pub fn new(timestamp: u64, id_prefix: Vec<u8>) -> Result<Self> {
        if id_prefix.len() > 32 {
            return Err(Nip77Error::BadBound(format!(
                "id prefix of {} bytes",
                id_prefix.len()
            )));
        }
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    pub fn zero() -> Self {
        Self {
            timestamp: 0,
            id_prefix: Vec::new(),
        }
    }

    pub fn infinity() -> Self {
        Self {
            timestamp: TIMESTAMP_INFINITY,
            id_prefix: Vec::new(),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>, prev_timestamp: u64) {
        let encoded_timestamp = if self.timestamp == TIMESTAMP_INFINITY {
            0
        } else {
            1 + self.timestamp.saturating_sub(prev_timestamp)
        };
        out.extend_from_slice(&encode_varint(encoded_timestamp));
        out.extend_from_slice(&encode_varint(self.id_prefix.len() as u64));
        out.extend_from_slice(&self.id_prefix);
    }

    fn decode(data: &[u8], prev_timestamp: u64) -> Result<(Self, usize)> {
        let (raw_timestamp, mut offset) = decode_varint(data)?;
        let timestamp = if raw_timestamp == 0 {
            TIMESTAMP_INFINITY
        } else {
            prev_timestamp
                .checked_add(raw_timestamp - 1)
                .ok_or_else(|| Nip77Error::BadBound("timestamp overflow".to_string()))?
        };

        let (prefix_len, consumed) = decode_varint(&data[offset..])?;
        offset += consumed;
        if prefix_len > 32 {
            return Err(Nip77Error::BadBound(format!(
                "id prefix of {} bytes",
                prefix_len
            )));
        }
        let prefix_len = prefix_len as usize;
        if data.len() < offset + prefix_len {
            return Err(Nip77Error::Truncated);
        }
        let id_prefix = data[offset..offset + prefix_len].to_vec();
        offset += prefix_len;

        Ok((
            Self {
                timestamp,
                id_prefix,
            },
            offset,
        ))
    }

    /// Order a record against this bound: timestamps first, then the id
    /// compared against the (possibly shorter) prefix.
    fn is_after_record(&self, record: &Record) -> bool {
        match record.timestamp.cmp(&self.timestamp) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => {
                let n = self.id_prefix.len().min(32);
                record.id[..n] < self.id_prefix[..n]
            }
        }
    }
}

/// Per-range payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    /// Mode 0: nothing to exchange for this range
    Skip,
    /// Mode 1: 16-byte digest of the ids in the range
    Fingerprint([u8; 16]),
    /// Mode 2: the full id list for the range
    IdList(Vec<EventId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Exclusive upper bound
    pub upper_bound: Bound,
    pub payload: RangePayload,
}

impl Range {
    pub fn skip(upper_bound: Bound) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Skip,
        }
    }

    pub fn fingerprint(upper_bound: Bound, fingerprint: [u8; 16]) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Fingerprint(fingerprint),
        }
    }

    pub fn id_list(upper_bound: Bound, ids: Vec<EventId>) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::IdList(ids),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>, prev_timestamp: u64) {
        self.upper_bound.encode_into(out, prev_timestamp);
        match &self.payload {
            RangePayload::Skip => out.extend_from_slice(&encode_varint(0)),
            RangePayload::Fingerprint(fp) => {
                out.extend_from_slice(&encode_varint(1));
                out.extend_from_slice(fp);
            }
            RangePayload::IdList(ids) => {
                out.extend_from_slice(&encode_varint(2));
                out.extend_from_slice(&encode_varint(ids.len() as u64));
                for id in ids {
                    out.extend_from_slice(id);
                }
            }
        }
    }

    fn decode(data: &[u8], prev_timestamp: u64) -> Result<(Self, usize)> {
        let (upper_bound, mut offset) = Bound::decode(data, prev_timestamp)?;

        let (mode, consumed) = decode_varint(&data[offset..])?;
        offset += consumed;

        let payload = match mode {
            0 => RangePayload::Skip,
            1 => {
                if data.len() < offset + 16 {
                    return Err(Nip77Error::Truncated);
                }
                let mut fp = [0u8; 16];
                fp.copy_from_slice(&data[offset..offset + 16]);
                offset += 16;
                RangePayload::Fingerprint(fp)
            }
            2 => {
                let (count, consumed) = decode_varint(&data[offset..])?;
                offset += consumed;
                let count = count as usize;
                // bound before multiplying so a huge count cannot wrap or
                // drive the allocation
                if count > (data.len() - offset) / 32 {
                    return Err(Nip77Error::Truncated);
                }
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut id = [0u8; 32];
                    id.copy_from_slice(&data[offset..offset + 32]);
                    offset += 32;
                    ids.push(id);
                }
                RangePayload::IdList(ids)
            }
            other => return Err(Nip77Error::BadMode(other)),
        };

        Ok((
            Self {
                upper_bound,
                payload,
            },
            offset,
        ))
    }
}

/// A full protocol message: version byte followed by delta-encoded ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegentropyMessage {
    pub version: u8,
    pub ranges: Vec<Range>,
}

impl NegentropyMessage {
    pub fn new(ranges: Vec<Range>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            ranges,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.version];
        let mut prev_timestamp = 0;
        for range in &self.ranges {
            range.encode_into(&mut out, prev_timestamp);
            if range.upper_bound.timestamp != TIMESTAMP_INFINITY {
                prev_timestamp = range.upper_bound.timestamp;
            }
        }
        out
    }

    pub fn encode_hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let version = *data.first().ok_or(Nip77Error::Truncated)?;
        if version != PROTOCOL_VERSION_1 {
            return Err(Nip77Error::BadVersion(version));
        }

        let mut ranges = Vec::new();
        let mut offset = 1;
        let mut prev_timestamp = 0;
        while offset < data.len() {
            let (range, consumed) = Range::decode(&data[offset..], prev_timestamp)?;
            offset += consumed;
            if range.upper_bound.timestamp != TIMESTAMP_INFINITY {
                prev_timestamp = range.upper_bound.timestamp;
            }
            ranges.push(range);
        }

        Ok(Self { version, ranges })
    }

    pub fn decode_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| Nip77Error::BadHex(e.to_string()))?;
        Self::decode(&bytes)
    }
}

/// Digest of an id set: SHA-256 over (sum of ids mod 2^256, little-endian)
/// concatenated with the element count as a varint, truncated to 16 bytes.
pub fn calculate_fingerprint(ids: &[EventId]) -> [u8; 16] {
    let mut sum = [0u8; 32];
    for id in ids {
        let mut carry = 0u16;
        for (acc, &byte) in sum.iter_mut().zip(id.iter()) {
            let s = *acc as u16 + byte as u16 + carry;
            *acc = s as u8;
            carry = s >> 8;
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(sum);
    hasher.update(encode_varint(ids.len() as u64));
    let digest = hasher.finalize();

    let mut fingerprint = [0u8; 16];
    fingerprint.copy_from_slice(&digest[..16]);
    fingerprint
}

/// One element of the local set under reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Record {
    pub timestamp: u64,
    pub id: EventId,
}

impl Record {
    pub fn new(timestamp: u64, id: EventId) -> Self {
        Self { timestamp, id }
    }
}

/// Sort records by timestamp ascending, id ascending on ties — the order
/// the protocol requires for range bookkeeping.
pub fn sort_records(records: &mut [Record]) {
    records.sort_by(|a, b| match a.timestamp.cmp(&b.timestamp) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

/// Server-side reconciliation over a snapshot of local records.
///
/// The peer drives the exchange. For each incoming range: a matching
/// fingerprint yields Skip; a mismatch yields the local id list for the
/// range; an incoming id list is answered with the local id list so the
/// peer can diff. When a reply would carry only Skip ranges the session
/// is complete and `reconcile` returns an empty buffer.
#[derive(Debug)]
pub struct ReconciliationState {
    records: Vec<Record>,
    complete: bool,
}

impl ReconciliationState {
    pub fn new(mut records: Vec<Record>) -> Self {
        sort_records(&mut records);
        Self {
            records,
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Process one peer message and build the reply. An empty reply means
    /// the sets agree and the session is over.
    pub fn reconcile(&mut self, peer_message: &[u8]) -> Result<Vec<u8>> {
        let message = NegentropyMessage::decode(peer_message)?;

        let mut reply_ranges = Vec::with_capacity(message.ranges.len());
        let mut lower = Bound::zero();
        let mut any_payload = false;

        for range in message.ranges {
            let local_ids = self.ids_in_range(&lower, &range.upper_bound);

            let payload = match range.payload {
                RangePayload::Skip => RangePayload::Skip,
                RangePayload::Fingerprint(peer_fp) => {
                    if calculate_fingerprint(&local_ids) == peer_fp {
                        RangePayload::Skip
                    } else {
                        RangePayload::IdList(local_ids)
                    }
                }
                RangePayload::IdList(_) => RangePayload::IdList(local_ids),
            };

            if !matches!(payload, RangePayload::Skip) {
                any_payload = true;
            }
            lower = range.upper_bound.clone();
            reply_ranges.push(Range {
                upper_bound: range.upper_bound,
                payload,
            });
        }

        if !any_payload {
            self.complete = true;
            return Ok(Vec::new());
        }

        Ok(NegentropyMessage::new(reply_ranges).encode())
    }

    fn ids_in_range(&self, lower: &Bound, upper: &Bound) -> Vec<EventId> {
        self.records
            .iter()
            .filter(|r| !lower.is_after_record(r) && upper.is_after_record(r))
            .map(|r| r.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_edge_values() {
        assert_eq!(encode_varint(0), vec![0]);
        assert_eq!(encode_varint(127), vec![127]);
        assert_eq!(encode_varint(128), vec![0x81, 0x00]);
        assert_eq!(encode_varint(300), vec![0x82, 0x2c]);
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX] {
            let encoded = encode_varint(value);
            let (decoded, len) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn test_varint_decode_incomplete() {
        assert!(decode_varint(&[0x81]).is_err());
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn test_bound_roundtrip() {
        let bound = Bound::new(12345, vec![0xab, 0xcd]).unwrap();
        let mut encoded = Vec::new();
        bound.encode_into(&mut encoded, 0);
        let (decoded, consumed) = Bound::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, bound);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_bound_infinity_roundtrip() {
        let bound = Bound::infinity();
        let mut encoded = Vec::new();
        bound.encode_into(&mut encoded, 1000);
        let (decoded, _) = Bound::decode(&encoded, 1000).unwrap();
        assert_eq!(decoded.timestamp, TIMESTAMP_INFINITY);
    }

    #[test]
    fn test_bound_prefix_too_long() {
        assert!(Bound::new(0, vec![0u8; 33]).is_err());
    }

    #[test]
    fn test_message_roundtrip_all_modes() {
        let msg = NegentropyMessage::new(vec![
            Range::skip(Bound::new(100, vec![]).unwrap()),
            Range::fingerprint(Bound::new(200, vec![]).unwrap(), [0xab; 16]),
            Range::id_list(Bound::infinity(), vec![[0x01; 32], [0x02; 32]]),
        ]);
        let decoded = NegentropyMessage::decode_hex(&msg.encode_hex()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_bad_version() {
        assert!(matches!(
            NegentropyMessage::decode(&[0x60]),
            Err(Nip77Error::BadVersion(0x60))
        ));
    }

    #[test]
    fn test_id_list_count_overflow_rejected() {
        // version, bound (delta 1, empty prefix), mode 2, varint count 2^59,
        // then nothing: the claimed count must be rejected before any
        // allocation, even where the length math would wrap
        let mut payload = vec![0x61, 0x01, 0x00, 0x02, 0x88];
        payload.extend_from_slice(&[0x80; 7]);
        payload.push(0x00);
        assert!(matches!(
            NegentropyMessage::decode(&payload),
            Err(Nip77Error::Truncated)
        ));
    }

    #[test]
    fn test_fingerprint_is_commutative() {
        let ids = [[0x01; 32], [0x02; 32], [0x03; 32]];
        let reversed = [[0x03; 32], [0x02; 32], [0x01; 32]];
        assert_eq!(calculate_fingerprint(&ids), calculate_fingerprint(&reversed));
    }

    #[test]
    fn test_fingerprint_counts_multiplicity() {
        let one = calculate_fingerprint(&[[0x01; 32]]);
        let two = calculate_fingerprint(&[[0x01; 32], [0x01; 32]]);
        assert_ne!(one, two);
    }

    #[test]
    fn test_sort_records() {
        let mut records = vec![
            Record::new(100, [0x03; 32]),
            Record::new(50, [0x01; 32]),
            Record::new(100, [0x01; 32]),
        ];
        sort_records(&mut records);
        assert_eq!(records[0].timestamp, 50);
        assert_eq!(records[1].id, [0x01; 32]);
        assert_eq!(records[2].id, [0x03; 32]);
    }

    fn full_range_fingerprint(records: &[Record]) -> Vec<u8> {
        let ids: Vec<EventId> = records.iter().map(|r| r.id).collect();
        NegentropyMessage::new(vec![Range::fingerprint(
            Bound::infinity(),
            calculate_fingerprint(&ids),
        )])
        .encode()
    }

    #[test]
    fn test_reconcile_identical_sets_completes() {
        let records = vec![Record::new(10, [0x01; 32]), Record::new(20, [0x02; 32])];
        let mut state = ReconciliationState::new(records.clone());

        let reply = state.reconcile(&full_range_fingerprint(&records)).unwrap();
        assert!(reply.is_empty());
        assert!(state.is_complete());
    }

    #[test]
    fn test_reconcile_mismatch_returns_id_list() {
        let local = vec![Record::new(10, [0x01; 32]), Record::new(20, [0x02; 32])];
        let peer = vec![Record::new(10, [0x01; 32])];
        let mut state = ReconciliationState::new(local);

        let reply = state.reconcile(&full_range_fingerprint(&peer)).unwrap();
        assert!(!reply.is_empty());
        assert!(!state.is_complete());

        let message = NegentropyMessage::decode(&reply).unwrap();
        assert_eq!(message.ranges.len(), 1);
        match &message.ranges[0].payload {
            RangePayload::IdList(ids) => {
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&[0x01; 32]));
                assert!(ids.contains(&[0x02; 32]));
            }
            other => panic!("expected id list, got {:?}", other),
        }
    }

    #[test]
    fn test_reconcile_id_list_answered_with_local_ids() {
        let local = vec![Record::new(10, [0x01; 32])];
        let mut state = ReconciliationState::new(local);

        let peer_msg = NegentropyMessage::new(vec![Range::id_list(
            Bound::infinity(),
            vec![[0x02; 32]],
        )])
        .encode();

        let reply = state.reconcile(&peer_msg).unwrap();
        let message = NegentropyMessage::decode(&reply).unwrap();
        match &message.ranges[0].payload {
            RangePayload::IdList(ids) => assert_eq!(ids, &vec![[0x01; 32]]),
            other => panic!("expected id list, got {:?}", other),
        }
    }

    #[test]
    fn test_reconcile_bounded_range() {
        // range [0, 15) covers only the first record
        let local = vec![Record::new(10, [0x01; 32]), Record::new(20, [0x02; 32])];
        let mut state = ReconciliationState::new(local);

        let peer_msg = NegentropyMessage::new(vec![
            Range::fingerprint(
                Bound::new(15, vec![]).unwrap(),
                calculate_fingerprint(&[[0x01; 32]]),
            ),
            Range::skip(Bound::infinity()),
        ])
        .encode();

        let reply = state.reconcile(&peer_msg).unwrap();
        assert!(reply.is_empty());
        assert!(state.is_complete());
    }
}
