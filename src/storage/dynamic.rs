//! Chunking of overflow payloads into dynamic record chains.

use smallvec::SmallVec;

use crate::storage::record::DynamicRecord;
use crate::types::{CoreError, LabelId, Result, NULL_REF};

/// Payload bytes per dynamic record.
pub const DYNAMIC_CHUNK_LEN: usize = 60;

/// Splits `data` into linked dynamic records, reusing ids of `existing` first.
pub fn write_chain(
    existing: &[DynamicRecord],
    data: &[u8],
    next_id: &mut dyn FnMut() -> Result<u64>,
) -> Result<Vec<DynamicRecord>> {
    let mut reusable = existing.iter().filter(|r| r.in_use).map(|r| r.id);
    let mut records: Vec<DynamicRecord> = Vec::new();
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&[][..]]
    } else {
        data.chunks(DYNAMIC_CHUNK_LEN).collect()
    };
    for chunk in chunks {
        let id = match reusable.next() {
            Some(id) => id,
            None => next_id()?,
        };
        if let Some(prev) = records.last_mut() {
            prev.next = id;
        }
        records.push(DynamicRecord::new(id, chunk.to_vec()));
    }
    Ok(records)
}

/// Ids of `old` records no longer present in `new`.
pub fn released_ids(old: &[DynamicRecord], new: &[DynamicRecord]) -> Vec<u64> {
    old.iter()
        .filter(|r| r.in_use && !new.iter().any(|n| n.id == r.id && n.in_use))
        .map(|r| r.id)
        .collect()
}

/// Concatenates the payload of a loaded chain.
pub fn read_chain(records: &[DynamicRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut expected = records.first().map(|r| r.id).unwrap_or(NULL_REF);
    for record in records {
        if record.id != expected || !record.in_use {
            return Err(CoreError::Inconsistency(format!(
                "dynamic chain broken at record {}",
                record.id
            )));
        }
        out.extend_from_slice(&record.data);
        expected = record.next;
    }
    Ok(out)
}

/// Big-endian encoding of a sorted label list.
pub fn encode_labels(labels: &[LabelId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(labels.len() * 4);
    for label in labels {
        out.extend_from_slice(&label.to_be_bytes());
    }
    out
}

/// Decodes a label list written by [`encode_labels`].
pub fn decode_labels(bytes: &[u8]) -> Result<SmallVec<[LabelId; 4]>> {
    if bytes.len() % 4 != 0 {
        return Err(CoreError::Inconsistency(
            "label payload length not a multiple of 4".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| LabelId::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(start: u64) -> impl FnMut() -> Result<u64> {
        let mut next = start;
        move || {
            let id = next;
            next += 1;
            Ok(id)
        }
    }

    #[test]
    fn chain_links_chunks_in_order() -> Result<()> {
        let data = vec![7u8; DYNAMIC_CHUNK_LEN * 2 + 5];
        let records = write_chain(&[], &data, &mut counter(10))?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].next, 11);
        assert_eq!(records[2].next, NULL_REF);
        assert_eq!(read_chain(&records)?, data);
        Ok(())
    }

    #[test]
    fn rewrite_reuses_existing_ids() -> Result<()> {
        let long = vec![1u8; DYNAMIC_CHUNK_LEN * 3];
        let first = write_chain(&[], &long, &mut counter(0))?;
        let second = write_chain(&first, b"short", &mut counter(100))?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, 0);
        assert_eq!(released_ids(&first, &second), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn labels_round_trip() -> Result<()> {
        let labels = [1, 5, 300, 70_000];
        assert_eq!(decode_labels(&encode_labels(&labels))?.as_slice(), &labels);
        assert!(decode_labels(&[1, 2, 3]).is_err());
        Ok(())
    }
}
