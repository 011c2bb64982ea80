//! Supporting utility types.
use bytes::Bytes;
use std::str::Utf8Error;

/// An immutable utf8 string backed by a shared [`Bytes`] buffer.
///
/// Column names, command tags, and notification payloads arrive as slices of
/// a backend frame; `ByteStr` hands them out and clones them without copying
/// anything out of the frame.
#[derive(Clone, Default)]
pub struct ByteStr {
    bytes: Bytes,
}

impl ByteStr {
    /// Validate `bytes` as utf8 and take ownership.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self { bytes })
    }

    /// Copy `string` into a freshly allocated buffer.
    pub fn copy_from_str(string: &str) -> Self {
        Self { bytes: Bytes::copy_from_slice(string.as_bytes()) }
    }

    /// Wrap a static str, no allocation or copy.
    pub const fn from_static(string: &'static str) -> Self {
        Self { bytes: Bytes::from_static(string.as_bytes()) }
    }

    /// Reslice to a `subset` of self, `O(1)` and no copy.
    ///
    /// # Panics
    ///
    /// `subset` must point into this `ByteStr`'s buffer, see
    /// [`Bytes::slice_ref`].
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self { bytes: self.bytes.slice_ref(subset.as_bytes()) }
    }

    pub fn as_str(&self) -> &str {
        // utf8 is validated on every construction path and never mutated
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&'static str> for ByteStr {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self { bytes: Bytes::from(value.into_bytes()) }
    }
}

macro_rules! eq {
    ($($ty:ty),*) => {$(
        impl PartialEq<$ty> for ByteStr {
            fn eq(&self, other: &$ty) -> bool {
                str::eq(self.as_str(), AsRef::<str>::as_ref(other))
            }
        }
    )*};
}

eq!(ByteStr, str, &str);

impl Eq for ByteStr { }

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self.as_str(), f)
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

/// Lossy rendering of possibly binary row bytes for debug output.
pub(crate) struct Lossy<'a>(pub &'a [u8]);

impl std::fmt::Display for Lossy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if b.is_ascii_graphic() || b.is_ascii_whitespace() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Lossy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b\"{self}\"")
    }
}

/// Create unit type `Error`.
///
/// # Example
///
/// ```ignore
/// unit_error! {
///     /// Resource not found.
///     pub struct NotFound("not found");
/// }
/// ```
macro_rules! unit_error {
    ($(#[$meta:meta])* $vis:vis struct $name:ident($msg:literal);) => {
        $(#[$meta])*
        $vis struct $name;

        impl std::error::Error for $name { }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($msg)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "\"{self}\"")
            }
        }
    };
}

/// Log when `log` feature enabled.
macro_rules! warning {
    ($($tt:tt)*) => {
        {
            #[cfg(feature = "log")]
            log::warn!($($tt)*);
        }
    };
}

/// Log when `log` feature enabled.
macro_rules! debug {
    ($($tt:tt)*) => {
        {
            #[cfg(feature = "log")]
            log::debug!($($tt)*);
        }
    };
}

/// Trace per-message traffic when `verbose` feature enabled.
macro_rules! verbose {
    ($($tt:tt)*) => {
        {
            #[cfg(feature = "verbose")]
            tracing::trace!($($tt)*);
        }
    };
}

pub(crate) use unit_error;
pub(crate) use warning;
pub(crate) use debug;
pub(crate) use verbose;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytestr_shares_the_buffer() {
        let frame = Bytes::from_static(b"relname\0rest");
        let name = ByteStr::from_utf8(frame.slice(..7)).unwrap();
        assert_eq!(name, "relname");
        assert_eq!(name.clone(), name);
        assert_eq!(name.slice_ref(&name[3..]), "name");

        ByteStr::from_utf8(Bytes::from_static(b"\xff\xfe")).unwrap_err();
    }

    #[test]
    fn lossy_escapes_binary() {
        assert_eq!(format!("{}", Lossy(b"ok 1\x02")), "ok 1\\x02");
        assert_eq!(format!("{:?}", Lossy(b"a")), "b\"a\"");
    }
}
