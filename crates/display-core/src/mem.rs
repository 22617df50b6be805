//! Checked arithmetic for buffer-size and pixel-address computations.
//!
//! Two flavours are provided deliberately: a recoverable form for sizing an
//! allocation up front, and an `_or_die` form for address math already deep
//! inside a drawing hot path, where a corrupt address cannot be recovered
//! from and the only sane response is to stop.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckedArithError {
    #[error("multiplication overflowed usize")]
    MulOverflow,
    #[error("addition overflowed usize")]
    AddOverflow,
    #[error("subtraction underflowed usize")]
    SubUnderflow,
}

/// Checked product of all `factors`. Empty input is treated as invalid, as
/// in the original, rather than returning an identity.
pub fn ckd_mul(factors: &[usize]) -> Result<usize, CheckedArithError> {
    let mut iter = factors.iter();
    let mut acc = *iter.next().ok_or(CheckedArithError::MulOverflow)?;
    for &factor in iter {
        acc = acc.checked_mul(factor).ok_or(CheckedArithError::MulOverflow)?;
    }
    Ok(acc)
}

pub fn ckd_add(terms: &[usize]) -> Result<usize, CheckedArithError> {
    let mut iter = terms.iter();
    let mut acc = *iter.next().ok_or(CheckedArithError::AddOverflow)?;
    for &term in iter {
        acc = acc.checked_add(term).ok_or(CheckedArithError::AddOverflow)?;
    }
    Ok(acc)
}

pub fn ckd_sub(terms: &[usize]) -> Result<usize, CheckedArithError> {
    let mut iter = terms.iter();
    let mut acc = *iter.next().ok_or(CheckedArithError::SubUnderflow)?;
    for &term in iter {
        acc = acc.checked_sub(term).ok_or(CheckedArithError::SubUnderflow)?;
    }
    Ok(acc)
}

/// Panics (rather than aborting the whole process, which Rust has no safe
/// hook for) if the multiplication overflows. Reserved for address math
/// where a wrapped result would otherwise silently corrupt a buffer.
pub fn ckd_mul_or_die(factors: &[usize]) -> usize {
    ckd_mul(factors).expect("checked multiplication overflowed")
}

pub fn ckd_add_or_die(terms: &[usize]) -> usize {
    ckd_add(terms).expect("checked addition overflowed")
}

pub fn ckd_sub_or_die(terms: &[usize]) -> usize {
    ckd_sub(terms).expect("checked subtraction underflowed")
}
