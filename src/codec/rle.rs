//! Run-length coding shared by the bitmap codecs
//!
//! Runs are stored as `[count: u8][unit bytes]` with `count` in `1..=255`.
//! Every codec in this module writes a one-byte mode marker ahead of its
//! payload so a raw fallback can be chosen when run-length coding would
//! expand the data.

/// Payload stored verbatim.
pub const MODE_RAW: u8 = 0;
/// Payload run-length coded.
pub const MODE_RLE: u8 = 1;

/// Run-length compress `data` treating each `unit` bytes as one sample.
pub fn compress(data: &[u8], unit: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let sample = &data[i..i + unit];
        let mut count = 1usize;
        let mut j = i + unit;

        while j + unit <= data.len() && count < 255 && &data[j..j + unit] == sample {
            count += 1;
            j += unit;
        }

        out.push(count as u8);
        out.extend_from_slice(sample);
        i = j;
    }

    out
}

/// Expand a buffer produced by [`compress`].
pub fn decompress(data: &[u8], unit: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;

    while i + 1 + unit <= data.len() + 1 && i < data.len() {
        let count = data[i] as usize;
        let sample = &data[i + 1..i + 1 + unit];
        for _ in 0..count {
            out.extend_from_slice(sample);
        }
        i += 1 + unit;
    }

    out
}

/// Compress with a raw fallback: emits `[mode][payload]`, picking whichever
/// representation is smaller.
pub fn compress_with_fallback(data: &[u8], unit: usize) -> Vec<u8> {
    let rle = compress(data, unit);
    let mut out = Vec::with_capacity(rle.len().min(data.len()) + 1);

    if rle.len() < data.len() {
        out.push(MODE_RLE);
        out.extend_from_slice(&rle);
    } else {
        out.push(MODE_RAW);
        out.extend_from_slice(data);
    }

    out
}

/// Expand a buffer produced by [`compress_with_fallback`].
pub fn decompress_with_fallback(data: &[u8], unit: usize) -> Vec<u8> {
    match data.split_first() {
        Some((&MODE_RLE, rest)) => decompress(rest, unit),
        Some((&MODE_RAW, rest)) => rest.to_vec(),
        _ => Vec::new(),
    }
}
