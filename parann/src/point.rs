//! Point storage shared by the clusterers and the groundtruth engine.
//!
//! A [`PointRange`] is an immutable, cheaply clonable collection of
//! fixed-dimension vectors with a declared [`Metric`]. Rows are stored
//! contiguously and padded with zeros to an aligned stride so that every row
//! starts on a 64-byte boundary relative to the buffer.
//!
//! On disk a point range uses the `.fbin` / `.u8bin` / `.i8bin` layout:
//! a little-endian `u32` row count, a `u32` dimension, then `n * dim`
//! coordinates.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::MmapOptions;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Handle of a point inside a [`PointRange`].
pub type PointId = u32;

const ALIGNMENT_BYTES: usize = 64;

/// Distance function of a point range.
///
/// Both metrics are expressed so that a smaller score is a better match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared Euclidean distance.
    Euclidean,
    /// Negated inner product (maximum inner product search).
    Mips,
}

impl Metric {
    /// Score between two coordinate slices of equal length.
    #[inline]
    pub fn distance<T: Coordinate>(self, a: &[T], b: &[T]) -> f32 {
        match self {
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(&x, &y)| {
                    let d = x.to_f32() - y.to_f32();
                    d * d
                })
                .sum(),
            Metric::Mips => -a
                .iter()
                .zip(b)
                .map(|(&x, &y)| x.to_f32() * y.to_f32())
                .sum::<f32>(),
        }
    }

    /// Floor of the metric's score range. Every real score is `>=` this value,
    /// which makes it the starting point for worst-candidate tracking.
    pub fn worst_possible_score(self) -> f32 {
        match self {
            Metric::Euclidean => 0.0,
            Metric::Mips => f32::MIN,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => write!(f, "Euclidian"),
            Metric::Mips => write!(f, "mips"),
        }
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euclidian" | "euclidean" | "l2" => Ok(Metric::Euclidean),
            "mips" | "ip" => Ok(Metric::Mips),
            other => Err(Error::InvalidParameter(format!(
                "unknown distance function '{other}', expected Euclidian or mips"
            ))),
        }
    }
}

/// Element type of a point's coordinates.
pub trait Coordinate: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Name used by the command-line tools (`float`, `uint8`, `int8`).
    const NAME: &'static str;

    /// Widens the value for distance computations.
    fn to_f32(self) -> f32;

    /// Stores a mean computed in double precision in the native
    /// representation, rounding integer types to the nearest value.
    fn from_mean(mean: f64) -> Self;

    /// Decodes `dst.len()` little-endian values.
    fn read_into<R: Read>(reader: &mut R, dst: &mut [Self]) -> io::Result<()>;

    /// Encodes `src` as little-endian values.
    fn write_from<W: Write>(writer: &mut W, src: &[Self]) -> io::Result<()>;
}

impl Coordinate for f32 {
    const NAME: &'static str = "float";

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    fn from_mean(mean: f64) -> Self {
        mean as f32
    }

    fn read_into<R: Read>(reader: &mut R, dst: &mut [Self]) -> io::Result<()> {
        reader.read_f32_into::<LittleEndian>(dst)
    }

    fn write_from<W: Write>(writer: &mut W, src: &[Self]) -> io::Result<()> {
        for &v in src {
            writer.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

impl Coordinate for u8 {
    const NAME: &'static str = "uint8";

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_mean(mean: f64) -> Self {
        // `as` saturates at the type bounds.
        mean.round() as u8
    }

    fn read_into<R: Read>(reader: &mut R, dst: &mut [Self]) -> io::Result<()> {
        reader.read_exact(dst)
    }

    fn write_from<W: Write>(writer: &mut W, src: &[Self]) -> io::Result<()> {
        writer.write_all(src)
    }
}

impl Coordinate for i8 {
    const NAME: &'static str = "int8";

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_mean(mean: f64) -> Self {
        mean.round() as i8
    }

    fn read_into<R: Read>(reader: &mut R, dst: &mut [Self]) -> io::Result<()> {
        reader.read_i8_into(dst)
    }

    fn write_from<W: Write>(writer: &mut W, src: &[Self]) -> io::Result<()> {
        for &v in src {
            writer.write_i8(v)?;
        }
        Ok(())
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvalidParameter(format!("{what} {value} does not fit in a u32")))
}

/// Row stride for `dim` coordinates of type `T`, rounded up to whole 64-byte blocks.
pub fn aligned_dimension<T>(dim: usize) -> usize {
    let per_block = (ALIGNMENT_BYTES / std::mem::size_of::<T>()).max(1);
    dim.div_ceil(per_block) * per_block
}

/// Borrowed view of one point.
#[derive(Debug, Clone, Copy)]
pub struct Point<'a, T: Coordinate> {
    id: PointId,
    coordinates: &'a [T],
    metric: Metric,
}

impl<'a, T: Coordinate> Point<'a, T> {
    /// Index of the point within the range it was taken from.
    pub fn id(&self) -> PointId {
        self.id
    }

    /// Coordinates without the alignment padding.
    pub fn coordinates(&self) -> &'a [T] {
        self.coordinates
    }

    /// Score against another point under this point's metric.
    pub fn distance(&self, other: &Point<'_, T>) -> f32 {
        self.metric.distance(self.coordinates, other.coordinates)
    }

    /// Score against raw coordinates, e.g. a centroid row.
    pub fn distance_to(&self, coordinates: &[T]) -> f32 {
        self.metric.distance(self.coordinates, coordinates)
    }

    /// See [`Metric::worst_possible_score`].
    pub fn worst_possible_score(&self) -> f32 {
        self.metric.worst_possible_score()
    }
}

/// Immutable collection of fixed-dimension points.
///
/// Cloning and [`get_slice`](Self::get_slice) share the underlying storage.
#[derive(Debug, Clone)]
pub struct PointRange<T: Coordinate> {
    data: Arc<[T]>,
    dim: usize,
    aligned_dim: usize,
    metric: Metric,
    /// First row of the underlying storage visible through this range.
    offset: usize,
    len: usize,
}

impl<T: Coordinate> PointRange<T> {
    /// Build a range from row-major coordinates without padding.
    pub fn from_flat(values: Vec<T>, dim: usize, metric: Metric) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidParameter("dimension must be > 0".into()));
        }
        if values.len() % dim != 0 {
            return Err(Error::InvalidParameter(format!(
                "{} values do not form rows of dimension {dim}",
                values.len()
            )));
        }

        let len = values.len() / dim;
        let aligned_dim = aligned_dimension::<T>(dim);
        let mut data = vec![T::default(); len * aligned_dim];
        for (row, chunk) in data
            .chunks_exact_mut(aligned_dim)
            .zip(values.chunks_exact(dim))
        {
            row[..dim].copy_from_slice(chunk);
        }

        Ok(Self::from_padded(data, dim, metric, len))
    }

    /// Build a range from an `[n, dim]` array.
    pub fn from_array(array: &Array2<T>, metric: Metric) -> Result<Self> {
        let (len, dim) = array.dim();
        if dim == 0 {
            return Err(Error::InvalidParameter("dimension must be > 0".into()));
        }

        let aligned_dim = aligned_dimension::<T>(dim);
        let mut data = vec![T::default(); len * aligned_dim];
        for (row, src) in data.chunks_exact_mut(aligned_dim).zip(array.rows()) {
            for (dst, &v) in row.iter_mut().zip(src.iter()) {
                *dst = v;
            }
        }

        Ok(Self::from_padded(data, dim, metric, len))
    }

    fn from_padded(data: Vec<T>, dim: usize, metric: Metric, len: usize) -> Self {
        Self {
            data: data.into(),
            dim,
            aligned_dim: aligned_dimension::<T>(dim),
            metric,
            offset: 0,
            len,
        }
    }

    /// Load a point file (`u32 n`, `u32 dim`, then `n * dim` values).
    pub fn load<P: AsRef<Path>>(path: P, metric: Metric) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < 8 {
            return Err(Error::InvalidFormat(format!(
                "{}: {file_len} bytes is too short for a point file header",
                path.display()
            )));
        }

        // SAFETY: the map is read-only and dropped before this function returns.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let mut reader: &[u8] = &mmap[..];
        let len = reader.read_u32::<LittleEndian>()? as usize;
        let dim = reader.read_u32::<LittleEndian>()? as usize;

        let expected = len
            .checked_mul(dim)
            .and_then(|count| count.checked_mul(std::mem::size_of::<T>()))
            .and_then(|bytes| bytes.checked_add(8))
            .ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "{}: header declares {len} x {dim} {} values, which overflows",
                    path.display(),
                    T::NAME
                ))
            })?;
        if expected != file_len {
            return Err(Error::InvalidFormat(format!(
                "{}: header declares {len} x {dim} {} values ({expected} bytes) but file has {file_len} bytes",
                path.display(),
                T::NAME
            )));
        }
        if dim == 0 {
            return Err(Error::InvalidFormat(format!(
                "{}: dimension is 0",
                path.display()
            )));
        }

        let aligned_dim = aligned_dimension::<T>(dim);
        let padded = len.checked_mul(aligned_dim).ok_or_else(|| {
            Error::InvalidFormat(format!(
                "{}: {len} rows of stride {aligned_dim} overflow",
                path.display()
            ))
        })?;
        let mut data = vec![T::default(); padded];
        for row in data.chunks_exact_mut(aligned_dim) {
            T::read_into(&mut reader, &mut row[..dim])?;
        }

        tracing::debug!(
            path = %path.display(),
            points = len,
            dim,
            "loaded point range"
        );

        Ok(Self::from_padded(data, dim, metric, len))
    }

    /// Write the visible rows in the point file layout.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_u32::<LittleEndian>(to_u32(self.len, "point count")?)?;
        writer.write_u32::<LittleEndian>(to_u32(self.dim, "dimension")?)?;
        for i in 0..self.len {
            T::write_from(&mut writer, self.row(i))?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Number of visible points.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Row stride of the storage, in elements.
    pub fn aligned_dimension(&self) -> usize {
        self.aligned_dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Number of leading points hidden by [`get_slice`](Self::get_slice),
    /// counted from the range this one was loaded as.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Coordinates of point `i`.
    ///
    /// # Panics
    /// Panics if `i >= self.len()`.
    #[inline]
    pub fn row(&self, i: usize) -> &[T] {
        assert!(i < self.len, "point {i} out of range for {} points", self.len);
        let start = (self.offset + i) * self.aligned_dim;
        &self.data[start..start + self.dim]
    }

    /// Point `i` of this range.
    ///
    /// # Panics
    /// Panics if `i >= self.len()`.
    #[inline]
    pub fn get(&self, i: usize) -> Point<'_, T> {
        Point {
            id: i as PointId,
            coordinates: self.row(i),
            metric: self.metric,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Point<'_, T>> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// View of this range without its first `offset` points.
    ///
    /// The view shares storage with `self` and renumbers points from 0.
    /// An offset past the end yields an empty view.
    pub fn get_slice(&self, offset: usize) -> Self {
        let skip = offset.min(self.len);
        Self {
            data: Arc::clone(&self.data),
            dim: self.dim,
            aligned_dim: self.aligned_dim,
            metric: self.metric,
            offset: self.offset + skip,
            len: self.len - skip,
        }
    }

    /// Fails with [`Error::IndexOutOfRange`] if any index is not `< self.len()`.
    pub fn check_indices(&self, indices: &[PointId]) -> Result<()> {
        let len = self.len;
        match indices.par_iter().find_any(|&&i| i as usize >= len) {
            Some(&index) => Err(Error::IndexOutOfRange {
                index: index as usize,
                len,
            }),
            None => Ok(()),
        }
    }

    /// All point ids of this range, in order.
    pub fn all_ids(&self) -> Vec<PointId> {
        (0..self.len as PointId).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_aligned_dimension() {
        assert_eq!(aligned_dimension::<f32>(1), 16);
        assert_eq!(aligned_dimension::<f32>(16), 16);
        assert_eq!(aligned_dimension::<f32>(17), 32);
        assert_eq!(aligned_dimension::<u8>(100), 128);
        assert_eq!(aligned_dimension::<i8>(64), 64);
    }

    #[test]
    fn test_metric_distances() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 6.0, 3.0];
        assert_eq!(Metric::Euclidean.distance(&a, &b), 25.0);
        assert_eq!(Metric::Mips.distance(&a, &b), -25.0);

        let c = [10u8, 0];
        let d = [0u8, 10];
        assert_eq!(Metric::Euclidean.distance(&c, &d), 200.0);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Euclidian".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert_eq!("l2".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert_eq!("mips".parse::<Metric>().unwrap(), Metric::Mips);
        assert!("cosine".parse::<Metric>().is_err());
    }

    #[test]
    fn test_from_mean_rounds_integers() {
        assert_eq!(u8::from_mean(2.5), 3);
        assert_eq!(u8::from_mean(-4.0), 0);
        assert_eq!(u8::from_mean(300.0), 255);
        assert_eq!(i8::from_mean(-2.5), -3);
        assert_eq!(f32::from_mean(0.25), 0.25);
    }

    #[test]
    fn test_from_flat_pads_rows() {
        let range = PointRange::from_flat(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], 3, Metric::Euclidean)
            .unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range.dimension(), 3);
        assert_eq!(range.aligned_dimension(), 16);
        assert_eq!(range.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(range.get(0).distance(&range.get(1)), 27.0);

        assert!(PointRange::from_flat(vec![1.0f32; 5], 3, Metric::Euclidean).is_err());
        assert!(PointRange::<f32>::from_flat(vec![], 0, Metric::Euclidean).is_err());
    }

    #[test]
    fn test_from_array() {
        let array = Array2::from_shape_fn((4, 5), |(i, j)| (i * 5 + j) as u8);
        let range = PointRange::from_array(&array, Metric::Mips).unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!(range.row(3), &[15, 16, 17, 18, 19]);
        assert_eq!(range.metric(), Metric::Mips);
    }

    #[test]
    fn test_get_slice_renumbers() {
        let range = PointRange::from_flat((0..10).map(|v| v as f32).collect(), 1, Metric::Euclidean)
            .unwrap();
        let slice = range.get_slice(3);
        assert_eq!(slice.len(), 7);
        assert_eq!(slice.offset(), 3);
        assert_eq!(slice.row(0), &[3.0]);
        assert_eq!(slice.get(2).id(), 2);

        let nested = slice.get_slice(2);
        assert_eq!(nested.offset(), 5);
        assert_eq!(nested.row(0), &[5.0]);

        assert!(range.get_slice(50).is_empty());
    }

    #[test]
    fn test_check_indices() {
        let range = PointRange::from_flat(vec![0.0f32; 8], 2, Metric::Euclidean).unwrap();
        assert!(range.check_indices(&[0, 1, 2, 3]).is_ok());
        match range.check_indices(&[0, 4]) {
            Err(Error::IndexOutOfRange { index, len }) => {
                assert_eq!(index, 4);
                assert_eq!(len, 4);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.i8bin");

        let values: Vec<i8> = (0..30).map(|v| (v as i8) - 15).collect();
        let range = PointRange::from_flat(values.clone(), 3, Metric::Euclidean).unwrap();
        range.get_slice(2).save(&path).unwrap();

        let loaded = PointRange::<i8>::load(&path, Metric::Euclidean).unwrap();
        assert_eq!(loaded.len(), 8);
        assert_eq!(loaded.dimension(), 3);
        assert_eq!(loaded.row(0), &values[6..9]);
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.fbin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 12]);
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            PointRange::<f32>::load(&path, Metric::Euclidean),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_load_rejects_overflowing_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.fbin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(1u32 << 31).to_le_bytes());
        bytes.extend_from_slice(&(1u32 << 31).to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            PointRange::<f32>::load(&path, Metric::Euclidean),
            Err(Error::InvalidFormat(_))
        ));
        assert!(matches!(
            PointRange::<u8>::load(&path, Metric::Euclidean),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_header_fields_must_fit_u32() {
        assert_eq!(to_u32(7, "dimension").unwrap(), 7);
        assert!(matches!(
            to_u32(u32::MAX as usize + 1, "point count"),
            Err(Error::InvalidParameter(_))
        ));
    }
}
