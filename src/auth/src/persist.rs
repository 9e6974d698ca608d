// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Saving and restoring the catalog across restarts.
//!
//! The on-disk layout is one little-endian record per grant row:
//! `user_len u32, user, ipv4 u32, prefix_bits u32, db_len i32 (-1 when the
//! row carries no database grant), db, password_len u32, password`. The
//! snapshot is written to a sibling temporary file and renamed into place,
//! so a crashed save never clobbers a good file. Single-char wildcard and
//! hostname patterns degrade to their numeric prefix on disk: the layout
//! has no pattern-string field.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::Ipv4Addr;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::catalog::{Catalog, DatabaseAccess, GrantRow};
use crate::host::{prefix_mask, HostPattern};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("corrupt user snapshot: {0}")]
    Corrupt(String),
}

/// Serialize every row of `catalog` to `path`, atomically replacing any
/// previous snapshot.
pub fn save(catalog: &Catalog, path: &Path) -> Result<(), PersistError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    {
        let mut w = BufWriter::new(&mut file);
        for row in catalog.dump() {
            write_row(&mut w, row)?;
        }
        w.flush()?;
    }
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a snapshot written by [`save`]. Any malformed record aborts the
/// whole load, so a torn file never half-populates a catalog.
pub fn load(path: &Path) -> Result<Vec<GrantRow>, PersistError> {
    let mut r = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    while let Some(user_len) = read_record_start(&mut r)? {
        let user = read_string(&mut r, user_len)?;
        let addr = Ipv4Addr::from(r.read_u32::<LittleEndian>().map_err(truncated)?);
        let bits = r.read_u32::<LittleEndian>().map_err(truncated)?;
        if bits > 32 {
            return Err(PersistError::Corrupt(format!(
                "prefix length {bits} out of range"
            )));
        }
        let bits = bits as u8;
        if u32::from(addr) & !prefix_mask(bits) != 0 {
            return Err(PersistError::Corrupt(format!(
                "address {addr} has bits below its /{bits} prefix"
            )));
        }
        let host = if bits == 0 && addr == Ipv4Addr::UNSPECIFIED {
            HostPattern::Any
        } else {
            HostPattern::Prefix { addr, bits }
        };
        let database = match r.read_i32::<LittleEndian>().map_err(truncated)? {
            -1 => DatabaseAccess::None,
            0 => DatabaseAccess::Any,
            len if len > 0 => DatabaseAccess::Named(read_string(&mut r, len as u32)?),
            len => {
                return Err(PersistError::Corrupt(format!(
                    "negative database length {len}"
                )))
            }
        };
        let password_len = r.read_u32::<LittleEndian>().map_err(truncated)?;
        let password_hash = read_string(&mut r, password_len)?;
        rows.push(GrantRow {
            user,
            host,
            database,
            password_hash,
        });
    }
    Ok(rows)
}

fn write_row<W: Write>(w: &mut W, row: &GrantRow) -> Result<(), PersistError> {
    w.write_u32::<LittleEndian>(field_len(row.user.len())?)?;
    w.write_all(row.user.as_bytes())?;
    let (addr, bits) = row.host.numeric_form();
    w.write_u32::<LittleEndian>(u32::from(addr))?;
    w.write_u32::<LittleEndian>(u32::from(bits))?;
    match &row.database {
        DatabaseAccess::None => w.write_i32::<LittleEndian>(-1)?,
        DatabaseAccess::Any => w.write_i32::<LittleEndian>(0)?,
        DatabaseAccess::Named(name) => {
            w.write_i32::<LittleEndian>(field_len(name.len())? as i32)?;
            w.write_all(name.as_bytes())?;
        }
    }
    w.write_u32::<LittleEndian>(field_len(row.password_hash.len())?)?;
    w.write_all(row.password_hash.as_bytes())?;
    Ok(())
}

/// Field lengths share one sanity bound in both directions: long enough for
/// any real name or digest, short enough that a garbage length from a
/// corrupt file cannot ask for an absurd allocation.
const MAX_FIELD_LEN: u32 = 1 << 20;

fn field_len(len: usize) -> Result<u32, PersistError> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_FIELD_LEN => Ok(len),
        _ => Err(PersistError::Corrupt(format!("field length {len} out of range"))),
    }
}

/// Read the next record's leading length, or `None` at a clean end of file.
/// Bytes that stop mid-header mean the file was truncated.
fn read_record_start<R: Read>(r: &mut R) -> Result<Option<u32>, PersistError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(PersistError::Corrupt("truncated record header".into()))
            };
        }
        filled += n;
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

fn read_string<R: Read>(r: &mut R, len: u32) -> Result<String, PersistError> {
    if len > MAX_FIELD_LEN {
        return Err(PersistError::Corrupt(format!(
            "field length {len} out of range"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|_| PersistError::Corrupt("non-UTF-8 field".into()))
}

fn truncated(err: io::Error) -> PersistError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        PersistError::Corrupt("truncated record".into())
    } else {
        PersistError::Io(err)
    }
}
