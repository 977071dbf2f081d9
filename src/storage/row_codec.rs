use crate::catalog::schema::{ColumnDef, TableDef};
use crate::catalog::types::{ColumnType, Row, Value};
use crate::error::SchemataError;
use crate::session::Session;
use crate::storage::encoded_key::EncodedKey;
use crate::storage::mapping::{StorageMapping, TreeCursor};
use compact_str::CompactString;
use tracing::error;

const ROW_FORMAT_VERSION: u8 = 1;
// version + table id + field count
const HEADER_LEN: usize = 1 + 4 + 2;
const CHECKSUM_LEN: usize = 4;

/// Physical row format. A row is stored as the single value under its
/// primary key:
///
/// ```text
/// version:u8 | table_id:u32 | fields:u16 | null bitmap | field data | crc32c:u32
/// ```
///
/// Fixed-width fields are 8 bytes (1 for booleans); text, json and blobs
/// carry a u32 length prefix. All integers are big-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowCodec;

impl RowCodec {
    pub fn encode(row: &Row, table: &TableDef) -> Result<Vec<u8>, SchemataError> {
        Self::encode_fields(row, &table.columns, table.table_id)
    }

    pub fn decode(key: &[u8], bytes: &[u8], table: &TableDef) -> Result<Row, SchemataError> {
        let (stored_id, row) = Self::decode_fields(key, bytes, &table.columns)?;
        if stored_id != table.table_id {
            return Err(corrupt(
                key,
                format!("row header names table {stored_id}, expected {}", table.table_id),
            ));
        }
        Ok(row)
    }

    /// Encodes `row` against `fields` in definition order, recording
    /// `header_id` as the owning table.
    pub fn encode_fields(row: &Row, fields: &[ColumnDef], header_id: u32) -> Result<Vec<u8>, SchemataError> {
        if row.len() != fields.len() {
            return Err(SchemataError::Validation(format!(
                "row has {} values, table has {} columns",
                row.len(),
                fields.len()
            )));
        }
        let field_count = u16::try_from(fields.len())
            .map_err(|_| SchemataError::Validation("too many columns".into()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + 16 * fields.len());
        out.push(ROW_FORMAT_VERSION);
        out.extend_from_slice(&header_id.to_be_bytes());
        out.extend_from_slice(&field_count.to_be_bytes());
        let bitmap_at = out.len();
        out.resize(bitmap_at + fields.len().div_ceil(8), 0);

        for (i, (value, field)) in row.values.iter().zip(fields).enumerate() {
            if value.is_null() {
                if !field.nullable {
                    return Err(SchemataError::Validation(format!(
                        "column {} is not nullable",
                        field.name
                    )));
                }
                out[bitmap_at + i / 8] |= 1 << (i % 8);
                continue;
            }
            if value.column_type() != Some(field.col_type) {
                return Err(SchemataError::Validation(format!(
                    "column {} expects {}",
                    field.name,
                    field.col_type.name()
                )));
            }
            match value {
                Value::Integer(v) | Value::Timestamp(v) => out.extend_from_slice(&v.to_be_bytes()),
                Value::Float(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
                Value::Boolean(v) => out.push(u8::from(*v)),
                Value::Text(s) | Value::Json(s) => put_bytes(&mut out, s.as_bytes())?,
                Value::Blob(b) => put_bytes(&mut out, b)?,
                Value::Null => {}
            }
        }
        let checksum = crc32c::crc32c(&out);
        out.extend_from_slice(&checksum.to_be_bytes());
        Ok(out)
    }

    /// Inverse of `encode_fields`. Returns the header table id with the row.
    /// Rows written before trailing nullable columns were added decode those
    /// columns as null. A missing non-nullable column has no value to take
    /// and is reported as corruption.
    pub fn decode_fields(
        key: &[u8],
        bytes: &[u8],
        fields: &[ColumnDef],
    ) -> Result<(u32, Row), SchemataError> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(corrupt(key, format!("row is only {} bytes", bytes.len())));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32c::crc32c(body) != expected {
            return Err(corrupt(key, "checksum mismatch".into()));
        }

        let mut reader = Reader { bytes: body, pos: 0 };
        let version = reader.u8().map_err(|r| corrupt(key, r))?;
        if version != ROW_FORMAT_VERSION {
            return Err(corrupt(key, format!("unknown row format version {version}")));
        }
        let header_id = reader.u32().map_err(|r| corrupt(key, r))?;
        let field_count = usize::from(reader.u16().map_err(|r| corrupt(key, r))?);
        if field_count > fields.len() {
            return Err(corrupt(
                key,
                format!("row has {field_count} fields, table has {}", fields.len()),
            ));
        }
        let bitmap = reader
            .take(field_count.div_ceil(8))
            .map_err(|r| corrupt(key, r))?
            .to_vec();

        let mut values = Vec::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate().take(field_count) {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(Value::Null);
                continue;
            }
            let value = read_value(&mut reader, field.col_type).map_err(|r| corrupt(key, r))?;
            values.push(value);
        }
        if reader.pos != body.len() {
            return Err(corrupt(
                key,
                format!("{} trailing bytes after last field", body.len() - reader.pos),
            ));
        }
        if let Some(missing) = fields[field_count..].iter().find(|f| !f.nullable) {
            return Err(corrupt(
                key,
                format!(
                    "row has {field_count} fields and lacks non-nullable column {}",
                    missing.name
                ),
            ));
        }
        values.resize(fields.len(), Value::Null);
        Ok((header_id, Row::from_values(values)))
    }

    /// Storage key of `row`: the table's ordinal within its group followed by
    /// the primary key values, so group members never collide.
    pub fn primary_key(row: &Row, table: &TableDef) -> Result<EncodedKey, SchemataError> {
        let positions = table.primary_key_positions().ok_or_else(|| {
            SchemataError::Validation(format!("table {} has an unknown primary key column", table.name))
        })?;
        if positions.is_empty() {
            return Err(SchemataError::Validation(format!(
                "table {} has no primary key",
                table.name
            )));
        }
        let mut values = Vec::with_capacity(positions.len() + 1);
        values.push(Value::Integer(i64::from(table.ordinal)));
        for pos in positions {
            let value = row.get(pos).cloned().ok_or_else(|| {
                SchemataError::Validation(format!("row is missing primary key column {pos}"))
            })?;
            values.push(value);
        }
        Ok(EncodedKey::from_values(&values))
    }

    /// Stores `row` in the table's tree through a pooled cursor. The header
    /// records the volume-relative table id.
    pub fn write_row(
        mapping: &StorageMapping,
        session: &mut Session,
        table: &TableDef,
        row: &Row,
    ) -> Result<EncodedKey, SchemataError> {
        let key = Self::primary_key(row, table)?;
        let mut cursor = mapping.acquire_cursor(session, table)?;
        let stored_id = mapping.ais_to_store(cursor.handle().volume(), table.table_id)?;
        let result = Self::encode_fields(row, &table.columns, stored_id)
            .and_then(|bytes| cursor.store(key.as_slice(), &bytes));
        mapping.release_cursor(session, cursor);
        result.map(|()| key)
    }

    pub fn read_row(
        mapping: &StorageMapping,
        session: &mut Session,
        table: &TableDef,
        key: &EncodedKey,
    ) -> Result<Option<Row>, SchemataError> {
        let mut cursor = mapping.acquire_cursor(session, table)?;
        let result = Self::read_at(mapping, &mut cursor, table, key.as_slice());
        mapping.release_cursor(session, cursor);
        result
    }

    fn read_at(
        mapping: &StorageMapping,
        cursor: &mut TreeCursor,
        table: &TableDef,
        key: &[u8],
    ) -> Result<Option<Row>, SchemataError> {
        if !cursor.fetch(key)? {
            return Ok(None);
        }
        let (stored_id, row) = Self::decode_fields(key, cursor.value(), &table.columns)?;
        let owner = mapping.store_to_ais(cursor.handle().volume(), stored_id)?;
        if owner != Some(table.table_id) {
            return Err(corrupt(
                key,
                format!("row header names stored table {stored_id}, expected {}", table.table_id),
            ));
        }
        Ok(Some(row))
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), SchemataError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| SchemataError::Validation("field exceeds 4 GiB".into()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_value(reader: &mut Reader<'_>, col_type: ColumnType) -> Result<Value, String> {
    Ok(match col_type {
        ColumnType::Integer => Value::Integer(reader.i64()?),
        ColumnType::Timestamp => Value::Timestamp(reader.i64()?),
        ColumnType::Float => Value::Float(f64::from_bits(reader.i64()? as u64)),
        ColumnType::Boolean => match reader.u8()? {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            other => return Err(format!("invalid boolean byte {other}")),
        },
        ColumnType::Text => Value::Text(reader.text()?),
        ColumnType::Json => Value::Json(reader.text()?),
        ColumnType::Blob => Value::Blob(reader.bytes()?.to_vec()),
    })
}

fn corrupt(key: &[u8], reason: String) -> SchemataError {
    let key = hex::encode(key);
    error!(key = %key, reason = %reason, "row data corruption");
    SchemataError::RowDataCorruption { key, reason }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                format!(
                    "field of {n} bytes at offset {} overruns {}-byte row",
                    self.pos,
                    self.bytes.len()
                )
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, String> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8], String> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn text(&mut self) -> Result<CompactString, String> {
        let bytes = self.bytes()?;
        std::str::from_utf8(bytes)
            .map(CompactString::from)
            .map_err(|e| format!("invalid utf-8 in text field: {e}"))
    }
}
