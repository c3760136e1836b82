/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::convert::From;
use std::fmt;

use tracing::{instrument, Span};

use crate::error::LoaderError;
use crate::Result;

/// An offset relative to the base of a loaded image.
///
/// Use this type to distinguish between an offset and a raw pointer
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Offset(u64);

impl Offset {
    /// Add `len` bytes to this offset, returning `None` on overflow
    pub fn checked_add(self, len: u64) -> Option<Self> {
        self.0.checked_add(len).map(Self)
    }
}

impl From<u64> for Offset {
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl From<Offset> for u64 {
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    fn from(val: Offset) -> u64 {
        val.0
    }
}

/// Convert an `Offset` to a `usize`, returning an `Err` if the
/// conversion couldn't be made.
impl TryFrom<Offset> for usize {
    type Error = LoaderError;
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    fn try_from(val: Offset) -> Result<usize> {
        Ok(usize::try_from(val.0)?)
    }
}

impl TryFrom<usize> for Offset {
    type Error = LoaderError;
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    fn try_from(val: usize) -> Result<Offset> {
        Ok(u64::try_from(val).map(Offset::from)?)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::Offset;

    #[test]
    fn display_is_hex() {
        assert_eq!(Offset::from(0x1000).to_string(), "0x1000");
    }

    #[test]
    fn checked_add_overflow() {
        assert_eq!(Offset::from(u64::MAX).checked_add(1), None);
        assert_eq!(Offset::from(8).checked_add(8), Some(Offset::from(16)));
    }

    proptest! {
        #[test]
        fn usize_conversion(val in 0_usize..usize::MAX) {
            let off = Offset::try_from(val).unwrap();
            prop_assert_eq!(usize::try_from(off).unwrap(), val);
            prop_assert_eq!(u64::from(off), val as u64);
        }
    }
}
