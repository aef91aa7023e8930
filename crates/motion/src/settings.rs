//! Settings record layout, defaults, and the checksummed persistent-store
//! codec sitting on top of [`crate::hal::PersistentStore`].
//!
//! The storage medium is external (§6a); the record layout, checksum, and
//! defaults-recovery policy below are core logic and live here.

use bitflags::bitflags;

use crate::hal::PersistentStore;
use crate::N_AXIS;

/// Byte offset of the settings version byte.
pub const ADDR_VERSION: u32 = 0;
/// Byte offset of the packed global settings record.
pub const ADDR_GLOBAL: u32 = 1;
/// Byte offset of the coordinate-system offset table (8 records).
pub const ADDR_COORD_OFFSETS: u32 = 512;
/// Byte offset of the startup-line records.
pub const ADDR_STARTUP_LINES: u32 = 768;
/// Byte offset of the build-info record.
pub const ADDR_BUILD_INFO: u32 = 942;

/// Current settings schema version. Bumped when the packed layout changes.
pub const SETTINGS_VERSION: u8 = 10;

/// Number of work coordinate systems (G54..G59.3).
pub const N_COORDINATE_SYSTEM: usize = 8;
/// Number of startup lines executed automatically after reset.
pub const N_STARTUP_LINE: usize = 2;
/// Max length, in bytes, of a single startup line.
pub const STARTUP_LINE_LEN: usize = 80;

bitflags! {
    /// Boolean options packed into [`Settings::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
    pub struct SettingsFlags: u8 {
        const HARD_LIMIT_ENABLE    = 1 << 0;
        const SOFT_LIMIT_ENABLE    = 1 << 1;
        const HOMING_ENABLE        = 1 << 2;
        const INVERT_PROBE_PIN     = 1 << 4;
        const LASER_MODE           = 1 << 5;
        const HOMING_FORCE_ORIGIN  = 1 << 6;
    }
}

/// The global settings record (§3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct Settings {
    pub steps_per_mm: [f32; N_AXIS],
    pub max_rate: [f32; N_AXIS],
    pub acceleration: [f32; N_AXIS],
    /// Stored negative, per upstream convention: a machine's travel volume
    /// lies entirely at or below zero in machine coordinates.
    pub max_travel: [f32; N_AXIS],

    pub pulse_microseconds: u16,
    pub step_invert_mask: u8,
    pub dir_invert_mask: u8,
    /// Post-motion hold delay (ms) before drivers are deasserted. `0xFF`
    /// means "never deassert".
    pub stepper_idle_lock_time: u8,

    pub status_report_mask: u8,
    pub junction_deviation: f32,
    pub arc_tolerance: f32,

    pub rpm_max: f32,
    pub rpm_min: f32,

    pub flags: SettingsFlags,

    pub homing_dir_mask: u8,
    pub homing_feed_rate: f32,
    pub homing_seek_rate: f32,
    pub homing_debounce_delay: u16,
    pub homing_pulloff: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            steps_per_mm: [80.0; N_AXIS],
            max_rate: [500.0, 500.0, 500.0],
            acceleration: [10.0 * 60.0 * 60.0, 10.0 * 60.0 * 60.0, 10.0 * 60.0 * 60.0],
            max_travel: [-200.0, -200.0, -200.0],
            pulse_microseconds: 10,
            step_invert_mask: 0,
            dir_invert_mask: 0,
            stepper_idle_lock_time: 25,
            status_report_mask: 1,
            junction_deviation: 0.01,
            arc_tolerance: 0.002,
            rpm_max: 1000.0,
            rpm_min: 0.0,
            flags: SettingsFlags::HOMING_ENABLE,
            homing_dir_mask: 0,
            homing_feed_rate: 25.0,
            homing_seek_rate: 500.0,
            homing_debounce_delay: 250,
            homing_pulloff: 1.0,
        }
    }
}

// N_AXIS f32 fields: steps_per_mm, max_rate, acceleration, max_travel (4 arrays)
// plus pulse_microseconds(u16) + step_invert_mask(u8) + dir_invert_mask(u8) +
// stepper_idle_lock_time(u8) + status_report_mask(u8) + junction_deviation(f32)
// + arc_tolerance(f32) + rpm_max(f32) + rpm_min(f32) + flags(u8) +
// homing_dir_mask(u8) + homing_feed_rate(f32) + homing_seek_rate(f32) +
// homing_debounce_delay(u16) + homing_pulloff(f32).
const GLOBAL_RECORD_LEN: usize = 4 * N_AXIS * 4 + 2 + 1 + 1 + 1 + 1 + 4 + 4 + 4 + 4 + 1 + 1 + 4 + 4 + 2 + 4;

/// Rotating 8-bit checksum: `(checksum << 1) | (checksum >> 7)` folded with
/// the byte via wrapping addition. The upstream source disagrees with
/// itself on `|` vs `||` here (§9); only the bitwise form makes this a
/// rotating accumulator, so that is what is implemented.
pub fn rotate_and_accumulate(checksum: u8, byte: u8) -> u8 {
    let rotated = (checksum << 1) | (checksum >> 7);
    rotated.wrapping_add(byte)
}

fn checksum_of(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |cs, &b| rotate_and_accumulate(cs, b))
}

/// Serializes `settings` into its packed record plus a trailing checksum
/// byte and writes both starting at [`ADDR_GLOBAL`].
pub fn save(store: &mut impl PersistentStore, settings: &Settings) {
    store.write_byte(ADDR_VERSION, SETTINGS_VERSION);
    let bytes = to_bytes(settings);
    store.write_bytes(ADDR_GLOBAL, &bytes);
    store.write_byte(ADDR_GLOBAL + GLOBAL_RECORD_LEN as u32, checksum_of(&bytes));
}

/// Reads the settings record from the store. On a version mismatch or a
/// checksum failure, logs and returns [`Settings::default()`] rather than
/// propagating corrupted data (§7: checksum failures trigger a
/// defaults-restore, they do not alarm).
pub fn load(store: &mut impl PersistentStore) -> Settings {
    let version = store.read_byte(ADDR_VERSION);
    if version != SETTINGS_VERSION {
        #[cfg(feature = "defmt-logging")]
        defmt::warn!("settings version mismatch, restoring defaults");
        return Settings::default();
    }
    let mut bytes = [0u8; GLOBAL_RECORD_LEN];
    store.read_bytes(ADDR_GLOBAL, &mut bytes);
    let stored_checksum = store.read_byte(ADDR_GLOBAL + GLOBAL_RECORD_LEN as u32);
    if checksum_of(&bytes) != stored_checksum {
        #[cfg(feature = "defmt-logging")]
        defmt::warn!("settings checksum mismatch, restoring defaults");
        return Settings::default();
    }
    from_bytes(&bytes)
}

/// Appends `value` as little-endian bytes and returns the offset just past it.
fn put_f32(buf: &mut [u8], offset: usize, value: f32) -> usize {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    offset + 4
}
fn put_f32_array(buf: &mut [u8], offset: usize, values: &[f32; N_AXIS]) -> usize {
    let mut off = offset;
    for v in values {
        off = put_f32(buf, off, *v);
    }
    off
}
fn put_u16(buf: &mut [u8], offset: usize, value: u16) -> usize {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    offset + 2
}
fn put_u8(buf: &mut [u8], offset: usize, value: u8) -> usize {
    buf[offset] = value;
    offset + 1
}

fn get_f32(buf: &[u8], offset: usize) -> (f32, usize) {
    (f32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()), offset + 4)
}
fn get_f32_array(buf: &[u8], offset: usize) -> ([f32; N_AXIS], usize) {
    let mut values = [0.0f32; N_AXIS];
    let mut off = offset;
    for v in values.iter_mut() {
        let (value, next) = get_f32(buf, off);
        *v = value;
        off = next;
    }
    (values, off)
}
fn get_u16(buf: &[u8], offset: usize) -> (u16, usize) {
    (u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()), offset + 2)
}
fn get_u8(buf: &[u8], offset: usize) -> (u8, usize) {
    (buf[offset], offset + 1)
}

fn to_bytes(settings: &Settings) -> [u8; GLOBAL_RECORD_LEN] {
    let mut buf = [0u8; GLOBAL_RECORD_LEN];
    let mut off = 0;
    off = put_f32_array(&mut buf, off, &settings.steps_per_mm);
    off = put_f32_array(&mut buf, off, &settings.max_rate);
    off = put_f32_array(&mut buf, off, &settings.acceleration);
    off = put_f32_array(&mut buf, off, &settings.max_travel);
    off = put_u16(&mut buf, off, settings.pulse_microseconds);
    off = put_u8(&mut buf, off, settings.step_invert_mask);
    off = put_u8(&mut buf, off, settings.dir_invert_mask);
    off = put_u8(&mut buf, off, settings.stepper_idle_lock_time);
    off = put_u8(&mut buf, off, settings.status_report_mask);
    off = put_f32(&mut buf, off, settings.junction_deviation);
    off = put_f32(&mut buf, off, settings.arc_tolerance);
    off = put_f32(&mut buf, off, settings.rpm_max);
    off = put_f32(&mut buf, off, settings.rpm_min);
    off = put_u8(&mut buf, off, settings.flags.bits());
    off = put_u8(&mut buf, off, settings.homing_dir_mask);
    off = put_f32(&mut buf, off, settings.homing_feed_rate);
    off = put_f32(&mut buf, off, settings.homing_seek_rate);
    off = put_u16(&mut buf, off, settings.homing_debounce_delay);
    off = put_f32(&mut buf, off, settings.homing_pulloff);
    debug_assert_eq!(off, GLOBAL_RECORD_LEN);
    buf
}

fn from_bytes(buf: &[u8; GLOBAL_RECORD_LEN]) -> Settings {
    let (steps_per_mm, off) = get_f32_array(buf, 0);
    let (max_rate, off) = get_f32_array(buf, off);
    let (acceleration, off) = get_f32_array(buf, off);
    let (max_travel, off) = get_f32_array(buf, off);
    let (pulse_microseconds, off) = get_u16(buf, off);
    let (step_invert_mask, off) = get_u8(buf, off);
    let (dir_invert_mask, off) = get_u8(buf, off);
    let (stepper_idle_lock_time, off) = get_u8(buf, off);
    let (status_report_mask, off) = get_u8(buf, off);
    let (junction_deviation, off) = get_f32(buf, off);
    let (arc_tolerance, off) = get_f32(buf, off);
    let (rpm_max, off) = get_f32(buf, off);
    let (rpm_min, off) = get_f32(buf, off);
    let (flags_bits, off) = get_u8(buf, off);
    let (homing_dir_mask, off) = get_u8(buf, off);
    let (homing_feed_rate, off) = get_f32(buf, off);
    let (homing_seek_rate, off) = get_f32(buf, off);
    let (homing_debounce_delay, off) = get_u16(buf, off);
    let (homing_pulloff, off) = get_f32(buf, off);
    debug_assert_eq!(off, GLOBAL_RECORD_LEN);
    Settings {
        steps_per_mm,
        max_rate,
        acceleration,
        max_travel,
        pulse_microseconds,
        step_invert_mask,
        dir_invert_mask,
        stepper_idle_lock_time,
        status_report_mask,
        junction_deviation,
        arc_tolerance,
        rpm_max,
        rpm_min,
        flags: SettingsFlags::from_bits_truncate(flags_bits),
        homing_dir_mask,
        homing_feed_rate,
        homing_seek_rate,
        homing_debounce_delay,
        homing_pulloff,
    }
}

/// One coordinate-system offset record (G54..G59.3).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoordinateOffset {
    pub offset: [f32; N_AXIS],
}

/// Loads the coordinate offset table, defaulting any record whose checksum
/// fails to all-zero rather than aborting the whole table.
pub fn load_coordinate_offsets(store: &mut impl PersistentStore) -> [CoordinateOffset; N_COORDINATE_SYSTEM] {
    let record_len = core::mem::size_of::<[f32; N_AXIS]>();
    let stride = record_len as u32 + 1;
    let mut table = [CoordinateOffset::default(); N_COORDINATE_SYSTEM];
    for (i, slot) in table.iter_mut().enumerate() {
        let base = ADDR_COORD_OFFSETS + i as u32 * stride;
        let mut bytes = [0u8; 16];
        store.read_bytes(base, &mut bytes[..record_len]);
        let checksum = store.read_byte(base + record_len as u32);
        if checksum_of(&bytes[..record_len]) == checksum {
            let mut offset = [0.0f32; N_AXIS];
            for (axis, chunk) in bytes[..record_len].chunks_exact(4).enumerate() {
                offset[axis] = f32::from_le_bytes(chunk.try_into().unwrap());
            }
            slot.offset = offset;
        }
    }
    table
}

/// Persists one coordinate-system offset record.
pub fn save_coordinate_offset(store: &mut impl PersistentStore, index: usize, offset: &CoordinateOffset) {
    debug_assert!(index < N_COORDINATE_SYSTEM);
    let record_len = core::mem::size_of::<[f32; N_AXIS]>();
    let stride = record_len as u32 + 1;
    let base = ADDR_COORD_OFFSETS + index as u32 * stride;
    let mut bytes = [0u8; 16];
    for (axis, v) in offset.offset.iter().enumerate() {
        bytes[axis * 4..axis * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    store.write_bytes(base, &bytes[..record_len]);
    store.write_byte(base + record_len as u32, checksum_of(&bytes[..record_len]));
}

/// A fixed-capacity ASCII line read back from a length-prefixed text record
/// (§6 "startup-line records"/"build info"): a NUL-free string up to
/// `STARTUP_LINE_LEN` bytes, stored without the allocator this crate avoids.
#[derive(Debug, Clone, Copy)]
pub struct TextLine {
    bytes: [u8; STARTUP_LINE_LEN],
    len: usize,
}

impl TextLine {
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for TextLine {
    fn default() -> Self {
        TextLine { bytes: [0u8; STARTUP_LINE_LEN], len: 0 }
    }
}

/// Stride, in bytes, of one length-prefixed text record: one length byte,
/// `STARTUP_LINE_LEN` payload bytes, one trailing checksum byte. Shared by
/// both the startup-line table and the build-info record (§6 "startup-line
/// records"/"build info"), since both are just a NUL-absent ASCII line with
/// the same checksummed-record primitive as every other record here.
const TEXT_RECORD_STRIDE: u32 = 1 + STARTUP_LINE_LEN as u32 + 1;

/// Reads a length-prefixed text record at `base`. Returns an empty line on a
/// checksum failure, mirroring `load`'s "absent, not corrupted" policy.
fn read_text_record(store: &mut impl PersistentStore, base: u32) -> TextLine {
    let mut raw = [0u8; 1 + STARTUP_LINE_LEN];
    store.read_bytes(base, &mut raw);
    let checksum = store.read_byte(base + raw.len() as u32);
    if checksum_of(&raw) != checksum {
        return TextLine::default();
    }
    let len = (raw[0] as usize).min(STARTUP_LINE_LEN);
    if core::str::from_utf8(&raw[1..1 + len]).is_err() {
        return TextLine::default();
    }
    let mut line = TextLine::default();
    line.bytes[..len].copy_from_slice(&raw[1..1 + len]);
    line.len = len;
    line
}

/// Writes a length-prefixed text record at `base`, truncating to
/// `STARTUP_LINE_LEN` bytes if necessary.
fn write_text_record(store: &mut impl PersistentStore, base: u32, line: &str) {
    let mut raw = [0u8; 1 + STARTUP_LINE_LEN];
    let bytes = line.as_bytes();
    let len = bytes.len().min(STARTUP_LINE_LEN);
    raw[0] = len as u8;
    raw[1..1 + len].copy_from_slice(&bytes[..len]);
    store.write_bytes(base, &raw);
    store.write_byte(base + raw.len() as u32, checksum_of(&raw));
}

/// Reads startup line `n` (0-indexed, `n < N_STARTUP_LINE`), executed
/// automatically after every reset (§6 "startup-line records"). Absent or
/// corrupted slots read back as an empty line rather than an error.
pub fn read_startup_line(store: &mut impl PersistentStore, n: usize) -> TextLine {
    debug_assert!(n < N_STARTUP_LINE);
    read_text_record(store, ADDR_STARTUP_LINES + n as u32 * TEXT_RECORD_STRIDE)
}

/// Persists startup line `n`, truncating to `STARTUP_LINE_LEN` bytes.
pub fn store_startup_line(store: &mut impl PersistentStore, n: usize, line: &str) {
    debug_assert!(n < N_STARTUP_LINE);
    write_text_record(store, ADDR_STARTUP_LINES + n as u32 * TEXT_RECORD_STRIDE, line);
}

/// Reads the build-info string (§6 "build info"): an operator-settable
/// free-text identifier, unrelated to the crate's own version.
pub fn read_build_info(store: &mut impl PersistentStore) -> TextLine {
    read_text_record(store, ADDR_BUILD_INFO)
}

/// Persists the build-info string, truncating to `STARTUP_LINE_LEN` bytes.
pub fn store_build_info(store: &mut impl PersistentStore, line: &str) {
    write_text_record(store, ADDR_BUILD_INFO, line);
}
