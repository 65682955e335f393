//! Response vectors exchanged every step.
//!
//! A [`Response`] carries up to five vectors (displacement, velocity,
//! acceleration, force, time). Which of them are active, and how long each
//! one is, is described by a [`SizeVector`] negotiated once per session.

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of quantity carried by one response vector.
///
/// The discriminants are the wire values. `All` in the wire enumeration is
/// an array length, exposed here as [`ResponseType::COUNT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ResponseType {
    Disp = 0,
    Vel = 1,
    Accel = 2,
    Force = 3,
    Time = 4,
}

impl ResponseType {
    /// Number of response types.
    pub const COUNT: usize = 5;

    /// All response types in wire order.
    pub const ALL: [Self; Self::COUNT] = [Self::Disp, Self::Vel, Self::Accel, Self::Force, Self::Time];

    /// Position of this type in wire order.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`ResponseType::index`].
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Disp),
            1 => Some(Self::Vel),
            2 => Some(Self::Accel),
            3 => Some(Self::Force),
            4 => Some(Self::Time),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Disp => "disp",
            Self::Vel => "vel",
            Self::Accel => "accel",
            Self::Force => "force",
            Self::Time => "time",
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Matrices a site can be asked for besides the measured response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixKind {
    InitialStiffness,
    TangentStiffness,
    Damping,
    Mass,
}

impl fmt::Display for MatrixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialStiffness => "initial stiffness",
            Self::TangentStiffness => "tangent stiffness",
            Self::Damping => "damping",
            Self::Mass => "mass",
        };
        f.write_str(name)
    }
}

/// Which side of a negotiation a [`SizeVector`] describes.
///
/// Carried by size errors so a mismatch names the vectors that disagreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRole {
    /// Trial vectors handed to a site.
    Trial,
    /// Output vectors returned by a site.
    Output,
    /// Commands sent to the apparatus.
    Ctrl,
    /// Measurements read back from the apparatus.
    Daq,
}

impl SizeRole {
    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Trial => 0,
            Self::Output => 1,
            Self::Ctrl => 2,
            Self::Daq => 3,
        }
    }

    pub(crate) const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Trial,
            1 => Self::Output,
            2 => Self::Ctrl,
            _ => Self::Daq,
        }
    }
}

impl fmt::Display for SizeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trial => "trial",
            Self::Output => "output",
            Self::Ctrl => "ctrl",
            Self::Daq => "daq",
        };
        f.write_str(name)
    }
}

/// Number of scalars per response type.
///
/// Invariant: once a session's `setup` succeeds its ctrl and daq size
/// vectors never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SizeVector([usize; ResponseType::COUNT]);

impl SizeVector {
    pub const ZERO: Self = Self([0; ResponseType::COUNT]);

    #[must_use]
    pub const fn new(sizes: [usize; ResponseType::COUNT]) -> Self {
        Self(sizes)
    }

    #[inline]
    pub const fn get(&self, ty: ResponseType) -> usize {
        self.0[ty.index()]
    }

    pub fn set(&mut self, ty: ResponseType, size: usize) {
        self.0[ty.index()] = size;
    }

    /// Total number of scalars across all types.
    #[must_use]
    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&n| n == 0)
    }

    #[must_use]
    pub const fn as_array(&self) -> [usize; ResponseType::COUNT] {
        self.0
    }

    /// Copy of `self` with every type that is zero in `mask` zeroed out.
    #[must_use]
    pub fn masked_by(&self, mask: &Self) -> Self {
        let mut out = *self;
        for ty in ResponseType::ALL {
            if mask.get(ty) == 0 {
                out.set(ty, 0);
            }
        }
        out
    }

    /// Iterates `(type, size)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (ResponseType, usize)> + '_ {
        ResponseType::ALL.into_iter().map(|ty| (ty, self.get(ty)))
    }

    /// Sizes as doubles, for the setup record.
    #[must_use]
    pub fn to_wire(&self) -> [f64; ResponseType::COUNT] {
        self.0.map(|n| n as f64)
    }

    /// Parses five doubles written by [`SizeVector::to_wire`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if fewer than five values are given or a
    /// value is not a non-negative integer no larger than `cap`.
    pub fn from_wire(values: &[f64], cap: usize) -> Result<Self> {
        let Some(values) = values.get(..ResponseType::COUNT) else {
            return Err(Error::Protocol(format!(
                "size record holds {} values, expected {}",
                values.len(),
                ResponseType::COUNT
            )));
        };
        let mut sizes = Self::ZERO;
        for (ty, &raw) in ResponseType::ALL.iter().zip(values) {
            sizes.set(*ty, wire_count(raw, cap)?);
        }
        Ok(sizes)
    }
}

/// Decodes a count sent as a double.
pub(crate) fn wire_count(raw: f64, cap: usize) -> Result<usize> {
    if !raw.is_finite() || raw < 0.0 || raw.fract() != 0.0 || raw > cap as f64 {
        return Err(Error::Protocol(format!("invalid count {raw} on the wire")));
    }
    Ok(raw as usize)
}

impl Index<ResponseType> for SizeVector {
    type Output = usize;

    fn index(&self, ty: ResponseType) -> &usize {
        &self.0[ty.index()]
    }
}

impl From<[usize; ResponseType::COUNT]> for SizeVector {
    fn from(sizes: [usize; ResponseType::COUNT]) -> Self {
        Self(sizes)
    }
}

impl fmt::Display for SizeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// One set of response vectors: trial, control, daq or output.
///
/// Owners keep a `Response` around and overwrite it every step rather than
/// allocating a fresh one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    vectors: [Vec<f64>; ResponseType::COUNT],
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A response with every vector zero-filled to `sizes`.
    #[must_use]
    pub fn zeros(sizes: SizeVector) -> Self {
        let mut response = Self::new();
        response.resize(sizes);
        response
    }

    /// Builder form of [`Response::set`].
    #[must_use]
    pub fn with(mut self, ty: ResponseType, values: &[f64]) -> Self {
        self.set(ty, values);
        self
    }

    /// Replaces one vector, adopting the length of `values`.
    pub fn set(&mut self, ty: ResponseType, values: &[f64]) {
        let v = &mut self.vectors[ty.index()];
        v.clear();
        v.extend_from_slice(values);
    }

    #[inline]
    pub fn get(&self, ty: ResponseType) -> &[f64] {
        &self.vectors[ty.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, ty: ResponseType) -> &mut [f64] {
        &mut self.vectors[ty.index()]
    }

    pub fn disp(&self) -> &[f64] {
        self.get(ResponseType::Disp)
    }

    pub fn vel(&self) -> &[f64] {
        self.get(ResponseType::Vel)
    }

    pub fn accel(&self) -> &[f64] {
        self.get(ResponseType::Accel)
    }

    pub fn force(&self) -> &[f64] {
        self.get(ResponseType::Force)
    }

    pub fn time(&self) -> &[f64] {
        self.get(ResponseType::Time)
    }

    /// Current lengths of the five vectors.
    #[must_use]
    pub fn sizes(&self) -> SizeVector {
        let mut sizes = SizeVector::ZERO;
        for ty in ResponseType::ALL {
            sizes.set(ty, self.get(ty).len());
        }
        sizes
    }

    /// Resizes every vector to `sizes`, zero-filling new slots.
    pub fn resize(&mut self, sizes: SizeVector) {
        for ty in ResponseType::ALL {
            self.vectors[ty.index()].resize(sizes.get(ty), 0.0);
        }
    }

    /// Sets every value to zero, keeping lengths.
    pub fn clear_values(&mut self) {
        for v in &mut self.vectors {
            v.fill(0.0);
        }
    }

    /// Fails unless every vector has exactly the expected length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`]; vectors are never truncated or padded.
    pub fn check_sizes(&self, expected: SizeVector, role: SizeRole) -> Result<()> {
        let actual = self.sizes();
        if actual != expected {
            return Err(Error::SizeMismatch {
                role,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Copies `src` into a caller-owned buffer.
    ///
    /// A fresh buffer adopts the sizes of `src`; one that is already sized
    /// must match `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if the buffer is sized differently.
    pub fn fill_from(&mut self, src: &Self, expected: SizeVector, role: SizeRole) -> Result<()> {
        if self.sizes() != SizeVector::ZERO {
            self.check_sizes(expected, role)?;
        }
        self.clone_from(src);
        Ok(())
    }

    /// The five vectors as slices in wire order, for encoding.
    pub fn slices(&self) -> [&[f64]; ResponseType::COUNT] {
        [
            &self.vectors[0],
            &self.vectors[1],
            &self.vectors[2],
            &self.vectors[3],
            &self.vectors[4],
        ]
    }

    /// Refills the vectors from a flat payload laid out by `sizes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `flat` is shorter than `sizes.total()`.
    pub fn fill_from_flat(&mut self, sizes: SizeVector, flat: &[f64]) -> Result<()> {
        if flat.len() < sizes.total() {
            return Err(Error::Protocol(format!(
                "payload holds {} values, sizes {sizes} need {}",
                flat.len(),
                sizes.total()
            )));
        }
        let mut offset = 0;
        for (ty, n) in sizes.iter() {
            self.set(ty, &flat[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_type_indices_follow_wire_order() {
        for (i, ty) in ResponseType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
            assert_eq!(ResponseType::from_index(i), Some(*ty));
        }
        assert_eq!(ResponseType::from_index(5), None);
    }

    #[test]
    fn size_vector_mask_and_total() {
        let full = SizeVector::new([3, 3, 3, 3, 1]);
        let mask = SizeVector::new([1, 0, 0, 1, 0]);
        let masked = full.masked_by(&mask);
        assert_eq!(masked, SizeVector::new([3, 0, 0, 3, 0]));
        assert_eq!(masked.total(), 6);
        assert_eq!(masked[ResponseType::Force], 3);
    }

    #[test]
    fn size_vector_wire_rejects_fractional_counts() {
        let sizes = SizeVector::new([1, 0, 0, 1, 0]);
        assert_eq!(SizeVector::from_wire(&sizes.to_wire(), 256).unwrap(), sizes);
        assert!(SizeVector::from_wire(&[1.5, 0.0, 0.0, 0.0, 0.0], 256).is_err());
        assert!(SizeVector::from_wire(&[-1.0, 0.0, 0.0, 0.0, 0.0], 256).is_err());
        assert!(SizeVector::from_wire(&[1.0, 0.0], 256).is_err());
        assert!(SizeVector::from_wire(&[300.0, 0.0, 0.0, 0.0, 0.0], 256).is_err());
    }

    #[test]
    fn fill_from_flat_splits_by_sizes() {
        let sizes = SizeVector::new([1, 0, 0, 2, 0]);
        let mut r = Response::new();
        r.fill_from_flat(sizes, &[0.01, 5.0, 6.0, 0.0]).unwrap();
        assert_eq!(r.disp(), &[0.01]);
        assert_eq!(r.force(), &[5.0, 6.0]);
        assert!(r.vel().is_empty());
        assert_eq!(r.sizes(), sizes);

        assert!(r.fill_from_flat(sizes, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn check_sizes_reports_both_sides() {
        let r = Response::new().with(ResponseType::Disp, &[1.0, 2.0]);
        let err = r
            .check_sizes(SizeVector::new([1, 0, 0, 0, 0]), SizeRole::Trial)
            .unwrap_err();
        match err {
            Error::SizeMismatch {
                role,
                expected,
                actual,
            } => {
                assert_eq!(role, SizeRole::Trial);
                assert_eq!(expected.get(ResponseType::Disp), 1);
                assert_eq!(actual.get(ResponseType::Disp), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fill_from_refuses_a_wrongly_sized_buffer() {
        let sizes = SizeVector::new([1, 0, 0, 1, 0]);
        let src = Response::zeros(sizes)
            .with(ResponseType::Disp, &[0.1])
            .with(ResponseType::Force, &[123.0]);

        let mut fresh = Response::new();
        fresh.fill_from(&src, sizes, SizeRole::Output).unwrap();
        assert_eq!(fresh, src);

        let mut wide = Response::new().with(ResponseType::Disp, &[0.0; 3]);
        assert!(matches!(
            wide.fill_from(&src, sizes, SizeRole::Output),
            Err(Error::SizeMismatch {
                role: SizeRole::Output,
                ..
            })
        ));
        assert_eq!(wide.disp(), &[0.0; 3]);
    }
}
