//! Raw metadata header records.

use scroll::{Pread, Pwrite, SizeWith};

/// Signature for physical metadata as specified by ECMA-335.
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// First part of the metadata root, as specified in the ECMA-335 spec, II.24.2.1.
///
/// This includes everything before the version string.
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RootHeader {
    /// The metadata signature, always [`METADATA_SIGNATURE`].
    pub signature: u32,
    /// Major version, 1 (ignore on read).
    pub major_version: u16,
    /// Minor version, 1 (ignore on read).
    pub minor_version: u16,
    /// Reserved, always 0.
    pub reserved: u32,
    /// Number of bytes allocated to hold the version string, including the
    /// null terminator, rounded up to a multiple of 4.
    pub version_length: u32,
}

/// Second part of the metadata root: everything after the version string.
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RootHeaderPart2 {
    /// Reserved, always 0.
    pub flags: u16,
    /// Number of streams.
    pub streams: u16,
}

/// A stream header, as specified in the ECMA-335 spec, II.24.2.2.
///
/// Does not contain the stream's name due to its variable length.
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct StreamHeader {
    /// Offset to the start of this stream from the start of the metadata root.
    pub offset: u32,
    /// Size of this stream in bytes, a multiple of 4.
    pub size: u32,
}

/// The fixed header of the `#~` table stream, ECMA-335 II.24.2.6.
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct TableStreamHeader {
    /// Reserved, always 0.
    pub reserved: u32,
    /// Schema major version.
    pub major_version: u8,
    /// Schema minor version.
    pub minor_version: u8,
    /// Bit 0: large `#Strings`, bit 1: large `#GUID`, bit 2: large `#Blob`.
    pub heap_sizes: u8,
    /// Reserved, always 1.
    pub reserved2: u8,
    /// Bit N set means table N is present.
    pub valid: u64,
    /// Bit N set means table N is sorted by its declared key.
    pub sorted: u64,
}
