//! Constant-time utilities.

use subtle::{Choice, ConstantTimeEq};

/// Returns true if all bytes of the slice are zero, in constant time.
///
/// We use this for the "recognized" check on relay cells: timing must not
/// reveal which byte first differed.
pub(crate) fn is_zero(x: &[u8]) -> bool {
    let c: Choice = x
        .iter()
        .fold(Choice::from(1), |sofar, byte| sofar & byte.ct_eq(&0));
    c.into()
}

/// Compare two slices for equality in constant time.
///
/// Returns false if the slices have different lengths.
pub(crate) fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&[]));
        assert!(is_zero(&[0, 0, 0, 0]));
        assert!(!is_zero(&[0, 0, 0, 1]));
        assert!(!is_zero(&[9]));
    }

    #[test]
    fn test_bytes_eq() {
        assert!(bytes_eq(b"", b""));
        assert!(bytes_eq(b"abc", b"abc"));
        assert!(!bytes_eq(b"abc", b"abd"));
        assert!(!bytes_eq(b"abc", b"abcd"));
    }
}
