//! Property block encoding: inline values and dynamic value chains.

use crate::storage::dynamic::{read_chain, write_chain};
use crate::storage::record::{
    BlockValue, DynamicRecord, DynamicValueKind, PropertyBlock, INLINE_VALUE_LIMIT,
};
use crate::types::{CoreError, PropKeyId, PropertyValue, Result, NULL_REF};

/// Builds the block for `key = value`, reusing dynamic record ids of `previous`.
pub fn encode_block(
    key: PropKeyId,
    value: PropertyValue,
    previous: Option<&PropertyBlock>,
    next_id: &mut dyn FnMut() -> Result<u64>,
) -> Result<PropertyBlock> {
    let reusable: &[DynamicRecord] = match previous.map(|b| &b.value) {
        Some(BlockValue::Dynamic { records, .. }) => records,
        _ => &[],
    };
    let (kind, payload) = match value {
        PropertyValue::String(s) if s.len() > INLINE_VALUE_LIMIT => {
            (DynamicValueKind::String, s.into_bytes())
        }
        PropertyValue::Bytes(b) if b.len() > INLINE_VALUE_LIMIT => (DynamicValueKind::Bytes, b),
        inline => {
            return Ok(PropertyBlock {
                key,
                value: BlockValue::Inline(inline),
            })
        }
    };
    let records = write_chain(reusable, &payload, next_id)?;
    let first = records.first().map(|r| r.id).unwrap_or(NULL_REF);
    Ok(PropertyBlock {
        key,
        value: BlockValue::Dynamic {
            kind,
            first,
            records,
        },
    })
}

/// Decodes the value of a block. Dynamic values need their records loaded.
pub fn decode_block(block: &PropertyBlock) -> Result<PropertyValue> {
    match &block.value {
        BlockValue::Inline(value) => Ok(value.clone()),
        BlockValue::Dynamic { records, .. } if records.is_empty() => Err(CoreError::Invalid(
            format!("dynamic value of key {} not loaded", block.key),
        )),
        BlockValue::Dynamic { kind, records, .. } => {
            let bytes = read_chain(records)?;
            match kind {
                DynamicValueKind::Bytes => Ok(PropertyValue::Bytes(bytes)),
                DynamicValueKind::String => String::from_utf8(bytes)
                    .map(PropertyValue::String)
                    .map_err(|_| {
                        CoreError::Inconsistency(format!(
                            "string value of key {} is not UTF-8",
                            block.key
                        ))
                    }),
            }
        }
    }
}

/// Dynamic records of a block, empty for inline values.
pub fn block_records(block: &PropertyBlock) -> &[DynamicRecord] {
    match &block.value {
        BlockValue::Dynamic { records, .. } => records,
        BlockValue::Inline(_) => &[],
    }
}
