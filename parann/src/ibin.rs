//! Binary groundtruth files (`.ibin`).
//!
//! Layout, native byte order:
//! - header: `i32` row count `n`, `i32` row width `k`
//! - `n * k` `i32` neighbor ids, row-major, each row sorted by ascending score
//! - `n * k` `f32` scores in the same order

use crate::error::{Error, Result};
use crate::groundtruth::{sort_row, Groundtruth, GroundtruthRow, Neighbor};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidParameter(format!("{what} {value} does not fit in an i32")))
}

/// Sort every row by score and write the `.ibin` layout to `writer`.
///
/// The stored width is `k` capped at the shortest row, so a groundtruth
/// computed against fewer than `k` base points keeps its real width.
/// Returns the width written.
pub fn write_ibin_to<W: Write>(
    writer: &mut W,
    groundtruth: &mut [GroundtruthRow],
    k: usize,
) -> Result<usize> {
    groundtruth.par_iter_mut().for_each(|row| sort_row(row));

    let width = groundtruth
        .iter()
        .map(Vec::len)
        .min()
        .map_or(k, |shortest| shortest.min(k));

    writer.write_i32::<NativeEndian>(to_i32(groundtruth.len(), "row count")?)?;
    writer.write_i32::<NativeEndian>(to_i32(width, "row width")?)?;
    for row in groundtruth.iter() {
        for n in &row[..width] {
            writer.write_i32::<NativeEndian>(to_i32(n.id as usize, "point id")?)?;
        }
    }
    for row in groundtruth.iter() {
        for n in &row[..width] {
            writer.write_f32::<NativeEndian>(n.score)?;
        }
    }

    Ok(width)
}

/// Write a groundtruth file. Rows are sorted in place.
pub fn write_ibin<P: AsRef<Path>>(
    path: P,
    groundtruth: &mut [GroundtruthRow],
    k: usize,
) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let width = write_ibin_to(&mut writer, groundtruth, k)?;
    writer.flush()?;

    tracing::info!(
        path = %path.display(),
        rows = groundtruth.len(),
        width,
        "wrote groundtruth"
    );
    Ok(())
}

/// Write round `i` of a removal run to `"{prefix}{i}"`.
pub fn write_removal_rounds<P: AsRef<Path>>(
    prefix: P,
    rounds: &mut [Groundtruth],
    k: usize,
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(rounds.len());
    for (i, round) in rounds.iter_mut().enumerate() {
        let mut name = OsString::from(prefix.as_ref().as_os_str());
        name.push(i.to_string());
        let path = PathBuf::from(name);
        write_ibin(&path, round, k)?;
        paths.push(path);
    }
    Ok(paths)
}

/// Validate a `.ibin` header and return `(n, k, body length in bytes)`.
fn body_len(n: i32, k: i32) -> Result<(usize, usize, usize)> {
    if n < 0 || k < 0 {
        return Err(Error::InvalidFormat(format!(
            "negative groundtruth header ({n}, {k})"
        )));
    }
    let (n, k) = (n as usize, k as usize);
    let bytes = n
        .checked_mul(k)
        .and_then(|count| count.checked_mul(8))
        .ok_or_else(|| {
            Error::InvalidFormat(format!("groundtruth header ({n}, {k}) overflows"))
        })?;
    Ok((n, k, bytes))
}

/// Decode the `.ibin` layout from `reader`.
///
/// The body is read before anything is allocated from the header, so a
/// header that promises more data than the reader holds fails with
/// [`Error::InvalidFormat`].
pub fn read_ibin_from<R: Read>(reader: &mut R) -> Result<Groundtruth> {
    let n = reader.read_i32::<NativeEndian>()?;
    let k = reader.read_i32::<NativeEndian>()?;
    let (n, k, bytes) = body_len(n, k)?;

    let mut body = Vec::new();
    (&mut *reader).take(bytes as u64).read_to_end(&mut body)?;
    if body.len() != bytes {
        return Err(Error::InvalidFormat(format!(
            "groundtruth header ({n}, {k}) needs {bytes} body bytes, found {}",
            body.len()
        )));
    }

    let mut body = body.as_slice();
    let mut ids = vec![0i32; n * k];
    body.read_i32_into::<NativeEndian>(&mut ids)?;
    let mut scores = vec![0f32; n * k];
    body.read_f32_into::<NativeEndian>(&mut scores)?;

    if let Some(&id) = ids.iter().find(|&&id| id < 0) {
        return Err(Error::InvalidFormat(format!("negative point id {id}")));
    }

    Ok((0..n)
        .map(|i| {
            let range = i * k..(i + 1) * k;
            ids[range.clone()]
                .iter()
                .zip(&scores[range])
                .map(|(&id, &score)| Neighbor {
                    id: id as u32,
                    score,
                })
                .collect()
        })
        .collect())
}

/// Read a groundtruth file written by [`write_ibin`].
pub fn read_ibin<P: AsRef<Path>>(path: P) -> Result<Groundtruth> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let n = reader.read_i32::<NativeEndian>()?;
    let k = reader.read_i32::<NativeEndian>()?;
    let (_, _, bytes) = body_len(n, k)?;
    if file_len.checked_sub(8) != Some(bytes as u64) {
        return Err(Error::InvalidFormat(format!(
            "{}: header ({n}, {k}) declares {bytes} body bytes but file has {file_len} bytes",
            path.display()
        )));
    }

    let mut header = Vec::with_capacity(8);
    header.write_i32::<NativeEndian>(n)?;
    header.write_i32::<NativeEndian>(k)?;
    read_ibin_from(&mut header.as_slice().chain(reader))
}
