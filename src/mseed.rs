//! Decoder for SEED 2.x data records as served by FDSN dataselect.
//!
//! Handles either byte order, blockette 1000 (encoding, word order, record
//! length) and blockette 100 (exact sample rate), with INT16, INT32,
//! FLOAT32, FLOAT64, Steim-1 and Steim-2 payloads.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::debug;

use crate::error::HarvestError;
use crate::trace::{Segment, merge_contiguous};

const FIXED_HEADER_LEN: usize = 48;
const STEIM_FRAME_LEN: usize = 64;
const TIME_CORRECTION_APPLIED: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Int16,
    Int32,
    Float32,
    Float64,
    Steim1,
    Steim2,
}

impl Encoding {
    fn from_code(code: u8) -> Result<Self, HarvestError> {
        match code {
            1 => Ok(Self::Int16),
            3 => Ok(Self::Int32),
            4 => Ok(Self::Float32),
            5 => Ok(Self::Float64),
            10 => Ok(Self::Steim1),
            11 => Ok(Self::Steim2),
            other => Err(HarvestError::MiniSeed(format!(
                "unsupported data encoding {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct RecordHeader {
    network: String,
    station: String,
    location: String,
    channel: String,
    starttime: DateTime<Utc>,
    sample_count: usize,
    sampling_rate: f64,
    data_offset: usize,
    record_len: usize,
    encoding: Encoding,
    big_endian_data: bool,
}

/// Decodes a concatenation of records into merged per-channel segments.
pub fn decode(bytes: &[u8]) -> Result<Vec<Segment>, HarvestError> {
    let mut segments = Vec::new();
    let mut offset = 0usize;
    while offset + FIXED_HEADER_LEN <= bytes.len() {
        let rest = &bytes[offset..];
        if rest[..FIXED_HEADER_LEN].iter().all(|byte| *byte == 0 || *byte == b' ') {
            break;
        }
        let header = parse_header(rest)?;
        if header.record_len > rest.len() {
            return Err(HarvestError::MiniSeed(format!(
                "record at byte {offset} claims {} bytes but only {} remain",
                header.record_len,
                rest.len()
            )));
        }
        let record = &rest[..header.record_len];
        if header.sample_count > 0 && header.sampling_rate > 0.0 {
            let samples = decode_payload(record, &header)?;
            segments.push(Segment {
                network: header.network,
                station: header.station,
                location: header.location,
                channel: header.channel,
                starttime: header.starttime,
                sampling_rate: header.sampling_rate,
                samples,
            });
        }
        offset += header.record_len;
    }
    Ok(merge_contiguous(segments))
}

fn parse_header(record: &[u8]) -> Result<RecordHeader, HarvestError> {
    let big = detect_byte_order(record)?;

    let station = ascii_field(&record[8..13]);
    let location = ascii_field(&record[13..15]);
    let channel = ascii_field(&record[15..18]);
    let network = ascii_field(&record[18..20]);

    let mut starttime = parse_btime(&record[20..30], big)?;
    let sample_count = read_u16(record, 30, big) as usize;
    let rate_factor = read_u16(record, 32, big) as i16;
    let rate_multiplier = read_u16(record, 34, big) as i16;
    let activity_flags = record[36];
    let blockette_count = record[39] as usize;
    let time_correction = read_u32(record, 40, big) as i32;
    let data_offset = read_u16(record, 44, big) as usize;
    let first_blockette = read_u16(record, 46, big) as usize;

    if time_correction != 0 && activity_flags & TIME_CORRECTION_APPLIED == 0 {
        starttime += Duration::microseconds(i64::from(time_correction) * 100);
    }

    let mut sampling_rate = nominal_rate(rate_factor, rate_multiplier);
    let mut blockette_1000 = None;
    let mut cursor = first_blockette;
    let mut visited = 0usize;
    while cursor >= FIXED_HEADER_LEN && cursor + 4 <= record.len() && visited < blockette_count.max(1) {
        let kind = read_u16(record, cursor, big);
        let next = read_u16(record, cursor + 2, big) as usize;
        match kind {
            1000 if cursor + 8 <= record.len() => {
                blockette_1000 = Some((record[cursor + 4], record[cursor + 5], record[cursor + 6]));
            }
            100 if cursor + 8 <= record.len() => {
                let bits = read_u32(record, cursor + 4, big);
                let actual = f32::from_bits(bits) as f64;
                if actual.is_finite() && actual > 0.0 {
                    sampling_rate = actual;
                }
            }
            _ => {}
        }
        visited += 1;
        if next == 0 || next <= cursor {
            break;
        }
        cursor = next;
    }

    let (encoding_code, word_order, length_exponent) = blockette_1000.ok_or_else(|| {
        HarvestError::MiniSeed("record without blockette 1000".to_string())
    })?;
    if !(7..=20).contains(&length_exponent) {
        return Err(HarvestError::MiniSeed(format!(
            "implausible record length exponent {length_exponent}"
        )));
    }
    let record_len = 1usize << length_exponent;
    if data_offset > record_len {
        return Err(HarvestError::MiniSeed(format!(
            "data offset {data_offset} beyond record length {record_len}"
        )));
    }

    Ok(RecordHeader {
        network,
        station,
        location,
        channel,
        starttime,
        sample_count,
        sampling_rate,
        data_offset,
        record_len,
        encoding: Encoding::from_code(encoding_code)?,
        big_endian_data: word_order == 1,
    })
}

fn detect_byte_order(record: &[u8]) -> Result<bool, HarvestError> {
    let plausible = |year: u16| (1900..=2100).contains(&year);
    if plausible(read_u16(record, 20, true)) {
        Ok(true)
    } else if plausible(read_u16(record, 20, false)) {
        Ok(false)
    } else {
        Err(HarvestError::MiniSeed(
            "cannot determine header byte order".to_string(),
        ))
    }
}

fn parse_btime(field: &[u8], big: bool) -> Result<DateTime<Utc>, HarvestError> {
    let year = read_u16(field, 0, big) as i32;
    let day_of_year = read_u16(field, 2, big) as u32;
    let hour = field[4] as i64;
    let minute = field[5] as i64;
    let second = field[6] as i64;
    let ten_thousandths = read_u16(field, 8, big) as i64;

    let date = NaiveDate::from_yo_opt(year, day_of_year).ok_or_else(|| {
        HarvestError::MiniSeed(format!("invalid record date {year}-{day_of_year}"))
    })?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| HarvestError::MiniSeed("invalid record time".to_string()))?
        .and_utc();
    Ok(midnight
        + Duration::hours(hour)
        + Duration::minutes(minute)
        + Duration::seconds(second)
        + Duration::microseconds(ten_thousandths * 100))
}

fn nominal_rate(factor: i16, multiplier: i16) -> f64 {
    let factor = f64::from(factor);
    let multiplier = f64::from(multiplier);
    match (factor, multiplier) {
        (f, _) if f == 0.0 => 0.0,
        (f, m) if m == 0.0 => f.max(0.0),
        (f, m) if f > 0.0 && m > 0.0 => f * m,
        (f, m) if f > 0.0 => -f / m,
        (f, m) if m > 0.0 => -m / f,
        (f, m) => 1.0 / (f * m),
    }
}

fn decode_payload(record: &[u8], header: &RecordHeader) -> Result<Vec<f64>, HarvestError> {
    let data = &record[header.data_offset..header.record_len];
    let count = header.sample_count;
    let big = header.big_endian_data;
    let fixed = |width: usize| -> Result<(), HarvestError> {
        if data.len() < count * width {
            return Err(HarvestError::MiniSeed(format!(
                "payload holds {} bytes, {count} samples need {}",
                data.len(),
                count * width
            )));
        }
        Ok(())
    };
    match header.encoding {
        Encoding::Int16 => {
            fixed(2)?;
            Ok((0..count)
                .map(|i| f64::from(read_u16(data, i * 2, big) as i16))
                .collect())
        }
        Encoding::Int32 => {
            fixed(4)?;
            Ok((0..count)
                .map(|i| f64::from(read_u32(data, i * 4, big) as i32))
                .collect())
        }
        Encoding::Float32 => {
            fixed(4)?;
            Ok((0..count)
                .map(|i| f64::from(f32::from_bits(read_u32(data, i * 4, big))))
                .collect())
        }
        Encoding::Float64 => {
            fixed(8)?;
            Ok((0..count)
                .map(|i| f64::from_bits(read_u64(data, i * 8, big)))
                .collect())
        }
        Encoding::Steim1 => decode_steim(data, count, big, 1).map(to_f64),
        Encoding::Steim2 => decode_steim(data, count, big, 2).map(to_f64),
    }
}

fn to_f64(values: Vec<i32>) -> Vec<f64> {
    values.into_iter().map(f64::from).collect()
}

fn decode_steim(data: &[u8], count: usize, big: bool, level: u8) -> Result<Vec<i32>, HarvestError> {
    let mut diffs: Vec<i32> = Vec::with_capacity(count);
    let mut first = None;
    let mut last = 0i32;

    for (frame_index, frame) in data.chunks_exact(STEIM_FRAME_LEN).enumerate() {
        let nibbles = read_u32(frame, 0, big);
        for word_index in 1..16 {
            let word = read_u32(frame, word_index * 4, big);
            if frame_index == 0 && word_index == 1 {
                first = Some(word as i32);
                continue;
            }
            if frame_index == 0 && word_index == 2 {
                last = word as i32;
                continue;
            }
            let code = (nibbles >> (30 - 2 * word_index)) & 0x3;
            unpack_word(code, word, level, &mut diffs)?;
        }
        if diffs.len() >= count {
            break;
        }
    }

    let first = first.ok_or_else(|| HarvestError::MiniSeed("empty Steim payload".to_string()))?;
    if diffs.len() < count {
        return Err(HarvestError::MiniSeed(format!(
            "Steim payload holds {} differences, header announces {count} samples",
            diffs.len()
        )));
    }

    // The first difference links to the previous record and is not used.
    let mut samples = Vec::with_capacity(count);
    let mut current = first;
    samples.push(current);
    for diff in diffs.iter().take(count).skip(1) {
        current = current.wrapping_add(*diff);
        samples.push(current);
    }
    if current != last {
        debug!(expected = last, decoded = current, "Steim reverse integration constant mismatch");
    }
    Ok(samples)
}

fn unpack_word(code: u32, word: u32, level: u8, diffs: &mut Vec<i32>) -> Result<(), HarvestError> {
    match (level, code) {
        (_, 0) => {}
        (_, 1) => {
            for shift in [24, 16, 8, 0] {
                diffs.push(sign_extend(word >> shift, 8));
            }
        }
        (1, 2) => {
            diffs.push(sign_extend(word >> 16, 16));
            diffs.push(sign_extend(word, 16));
        }
        (1, 3) => diffs.push(word as i32),
        (2, 2) => match word >> 30 {
            1 => diffs.push(sign_extend(word, 30)),
            2 => {
                for shift in [15, 0] {
                    diffs.push(sign_extend(word >> shift, 15));
                }
            }
            3 => {
                for shift in [20, 10, 0] {
                    diffs.push(sign_extend(word >> shift, 10));
                }
            }
            _ => return Err(HarvestError::MiniSeed("invalid Steim-2 dnib 0 for code 2".to_string())),
        },
        (2, 3) => match word >> 30 {
            0 => {
                for shift in [24, 18, 12, 6, 0] {
                    diffs.push(sign_extend(word >> shift, 6));
                }
            }
            1 => {
                for shift in [25, 20, 15, 10, 5, 0] {
                    diffs.push(sign_extend(word >> shift, 5));
                }
            }
            2 => {
                for shift in [24, 20, 16, 12, 8, 4, 0] {
                    diffs.push(sign_extend(word >> shift, 4));
                }
            }
            _ => return Err(HarvestError::MiniSeed("invalid Steim-2 dnib 3 for code 3".to_string())),
        },
        (level, code) => {
            return Err(HarvestError::MiniSeed(format!(
                "invalid Steim-{level} nibble code {code}"
            )));
        }
    }
    Ok(())
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

fn read_u16(bytes: &[u8], offset: usize, big: bool) -> u16 {
    let raw = [bytes[offset], bytes[offset + 1]];
    if big {
        u16::from_be_bytes(raw)
    } else {
        u16::from_le_bytes(raw)
    }
}

fn read_u32(bytes: &[u8], offset: usize, big: bool) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    if big {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    }
}

fn read_u64(bytes: &[u8], offset: usize, big: bool) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    if big {
        u64::from_be_bytes(raw)
    } else {
        u64::from_le_bytes(raw)
    }
}
