/// Byte-order marker stored in trace headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Endianness {
    Little = 0,
    Big = 1,
}

impl Endianness {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Little),
            1 => Some(Self::Big),
            _ => None,
        }
    }
}

/// Pointer width of the running process, in bytes.
pub fn host_pointer_size() -> u8 {
    std::mem::size_of::<usize>() as u8
}

/// Byte order of the running process.
pub fn host_endianness() -> Endianness {
    #[cfg(target_endian = "little")]
    {
        Endianness::Little
    }
    #[cfg(target_endian = "big")]
    {
        Endianness::Big
    }
}

/// Returns the architecture name string.
pub fn arch_name() -> &'static str {
    std::env::consts::ARCH
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(target_os = "android")]
    { "android" }
    #[cfg(not(any(
        target_os = "windows",
        target_os = "linux",
        target_os = "macos",
        target_os = "android"
    )))]
    { "unknown" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_size_matches_usize() {
        assert_eq!(host_pointer_size() as usize, std::mem::size_of::<*const u8>());
    }

    #[test]
    fn test_endianness_raw_roundtrip() {
        let host = host_endianness();
        assert_eq!(Endianness::from_raw(host as u8), Some(host));
        assert_eq!(Endianness::from_raw(7), None);
    }
}
