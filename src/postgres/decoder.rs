use bytes::{Buf, Bytes};
use std::collections::HashMap;
use tracing::{debug, trace};

use super::types::{DecodedEvent, Tuple};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
}

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// Decoder for pgoutput protocol version 1 messages.
///
/// Holds the relation cache for one replication session. The server announces
/// each relation's schema with an `R` message before the first row change that
/// references it, so a decoder must not outlive its stream: construct a fresh
/// one whenever the stream is recreated.
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
        }
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Decodes one message starting at the buffer's current position.
    ///
    /// Consumes exactly the bytes of that message, leaving the buffer
    /// positioned at the next one; callers drain a frame by looping while
    /// bytes remain. Returns `None` for messages that only update decoder
    /// state (Begin, Relation).
    pub fn decode_message(&mut self, buf: &mut Bytes) -> Result<Option<DecodedEvent>> {
        let tag = read_u8(buf)?;

        match tag {
            b'R' => self.decode_relation(buf),
            b'I' => self.decode_insert(buf),
            b'U' => self.decode_update(buf),
            b'D' => self.decode_delete(buf),
            b'B' => self.decode_begin(buf),
            b'C' => self.decode_commit(buf),
            other => Err(Error::InvalidMessage {
                message: format!("unknown message tag: 0x{other:02x}"),
            }),
        }
    }

    fn decode_relation(&mut self, buf: &mut Bytes) -> Result<Option<DecodedEvent>> {
        let rel_id = read_u32(buf)?;
        let namespace = read_cstring(buf)?;
        let name = read_cstring(buf)?;
        let _replica_identity = read_u8(buf)?;
        let column_count = read_i16(buf)?;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            let _flags = read_u8(buf)?;
            let col_name = read_cstring(buf)?;
            let type_oid = read_u32(buf)?;
            let _type_modifier = read_i32(buf)?;
            columns.push(ColumnInfo {
                name: col_name,
                type_oid,
            });
        }

        debug!("relation announced: {}={}.{}", rel_id, namespace, name);
        self.relations.insert(
            rel_id,
            RelationInfo {
                id: rel_id,
                namespace,
                name,
                columns,
            },
        );

        Ok(None)
    }

    fn decode_insert(&mut self, buf: &mut Bytes) -> Result<Option<DecodedEvent>> {
        let rel_id = read_u32(buf)?;
        let marker = read_u8(buf)?;
        if marker != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("unexpected tuple marker in insert: 0x{marker:02x}"),
            });
        }

        let relation = self.relation(rel_id)?;
        let data = parse_tuple(buf, &relation.columns)?;

        Ok(Some(DecodedEvent::Insert {
            table: relation.name.clone(),
            data,
        }))
    }

    fn decode_update(&mut self, buf: &mut Bytes) -> Result<Option<DecodedEvent>> {
        let rel_id = read_u32(buf)?;
        let relation = self.relation(rel_id)?;

        // Optional old image: 'K' carries key columns only and is skipped,
        // 'O' carries the full previous row. Either is followed by another
        // marker, which must introduce the new tuple.
        let mut marker = read_u8(buf)?;
        if marker == b'K' {
            skip_tuple(buf)?;
            marker = read_u8(buf)?;
        }

        let old = if marker == b'O' {
            let old = parse_tuple(buf, &relation.columns)?;
            marker = read_u8(buf)?;
            Some(old)
        } else {
            None
        };

        if marker != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("expected new-tuple marker in update, got 0x{marker:02x}"),
            });
        }
        let new = parse_tuple(buf, &relation.columns)?;

        Ok(Some(DecodedEvent::Update {
            table: relation.name.clone(),
            old,
            new,
        }))
    }

    fn decode_delete(&mut self, buf: &mut Bytes) -> Result<Option<DecodedEvent>> {
        let rel_id = read_u32(buf)?;
        // 'K' or 'O' depending on the table's replica identity; the old image
        // is parsed the same way either way.
        let _marker = read_u8(buf)?;

        let relation = self.relation(rel_id)?;
        let old = parse_tuple(buf, &relation.columns)?;

        Ok(Some(DecodedEvent::Delete {
            table: relation.name.clone(),
            old,
        }))
    }

    fn decode_begin(&mut self, buf: &mut Bytes) -> Result<Option<DecodedEvent>> {
        let final_lsn = read_u64(buf)?;
        let _commit_timestamp = read_i64(buf)?;
        let xid = read_u32(buf)?;

        trace!("begin: final_lsn={final_lsn}, xid={xid}");
        Ok(None)
    }

    fn decode_commit(&mut self, buf: &mut Bytes) -> Result<Option<DecodedEvent>> {
        let _flags = read_u8(buf)?;
        let commit_lsn = read_u64(buf)?;
        let _end_lsn = read_u64(buf)?;
        let commit_timestamp = read_i64(buf)?;

        trace!("commit: lsn={commit_lsn}");
        Ok(Some(DecodedEvent::Commit {
            lsn: commit_lsn,
            timestamp: commit_timestamp,
        }))
    }

    fn relation(&self, rel_id: u32) -> Result<&RelationInfo> {
        self.relations.get(&rel_id).ok_or_else(|| Error::InvalidMessage {
            message: format!("unknown relation id: {rel_id}"),
        })
    }
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses TupleData into an ordered map keyed by the cached column names.
///
/// The wire column count must equal the relation's column count. Format byte
/// 'n' means null; every other format carries a length-prefixed text payload.
fn parse_tuple(buf: &mut Bytes, columns: &[ColumnInfo]) -> Result<Tuple> {
    let column_count = read_i16(buf)?;
    if column_count as usize != columns.len() {
        return Err(Error::InvalidMessage {
            message: format!(
                "tuple column count mismatch: {} on wire, {} in relation",
                column_count,
                columns.len()
            ),
        });
    }

    let mut row = Tuple::new();
    for column in columns {
        let format = read_u8(buf)?;
        if format == b'n' {
            row.insert(column.name.clone(), serde_json::Value::Null);
        } else {
            let value = read_text(buf)?;
            row.insert(column.name.clone(), serde_json::Value::String(value));
        }
    }

    Ok(row)
}

/// Advances past a TupleData without materializing it.
fn skip_tuple(buf: &mut Bytes) -> Result<()> {
    let column_count = read_i16(buf)?;
    for _ in 0..column_count {
        let format = read_u8(buf)?;
        if format != b'n' {
            let len = read_len(buf)?;
            if buf.remaining() < len {
                return Err(truncated("tuple value"));
            }
            buf.advance(len);
        }
    }
    Ok(())
}

fn read_text(buf: &mut Bytes) -> Result<String> {
    let len = read_len(buf)?;
    if buf.remaining() < len {
        return Err(truncated("tuple value"));
    }
    let data = buf.split_to(len);
    Ok(String::from_utf8_lossy(&data).into_owned())
}

fn read_len(buf: &mut Bytes) -> Result<usize> {
    let len = read_i32(buf)?;
    usize::try_from(len).map_err(|_| Error::InvalidMessage {
        message: format!("negative value length: {len}"),
    })
}

fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let Some(nul) = buf.as_ref().iter().position(|b| *b == 0) else {
        return Err(truncated("string"));
    };
    let data = buf.split_to(nul);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&data).into_owned())
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut Bytes) -> Result<i16> {
    ensure(buf, 2, "i16")?;
    Ok(buf.get_i16())
}

fn read_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

fn read_u64(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

fn read_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8, "i64")?;
    Ok(buf.get_i64())
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(truncated(what));
    }
    Ok(())
}

fn truncated(what: &str) -> Error {
    Error::InvalidMessage {
        message: format!("truncated message reading {what}"),
    }
}
