//! Minimal NumPy `.npy` reader/writer for 1-D float vectors.
//!
//! Only what the reference cache needs: little-endian `<f4`/`<f8`,
//! C order, one dimension. Writes are always `<f4`, format version 1.0.

use std::io::{self, Read, Write};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum NpyError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("not an .npy file")]
    BadMagic,
    #[error("unsupported .npy version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("malformed header: {0}")]
    Header(String),
    #[error("unsupported dtype {0} (need <f4 or <f8)")]
    UnsupportedDtype(String),
    #[error("expected a 1-D array, got shape {0}")]
    UnsupportedShape(String),
    #[error("data truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Write `values` as a 1-D `<f4` array.
pub fn write_f32<W: Write>(mut w: W, values: &[f32]) -> Result<(), NpyError> {
    let dict = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    // magic(6) + version(2) + len(2) + dict + padding + '\n' is a multiple of 64.
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    let header_len = dict.len() + padding + 1;

    w.write_all(MAGIC)?;
    w.write_all(&[1, 0])?;
    w.write_all(&(header_len as u16).to_le_bytes())?;
    w.write_all(dict.as_bytes())?;
    w.write_all(&vec![b' '; padding])?;
    w.write_all(b"\n")?;

    let mut data = Vec::with_capacity(values.len() * 4);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&data)?;
    w.flush()?;
    Ok(())
}

/// Read a 1-D `<f4` or `<f8` array as `f32` values.
pub fn read_f32<R: Read>(mut r: R) -> Result<Vec<f32>, NpyError> {
    let mut magic = [0u8; 6];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let mut version = [0u8; 2];
    r.read_exact(&mut version)?;
    let header_len = match version[0] {
        1 => {
            let mut len = [0u8; 2];
            r.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            r.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        _ => return Err(NpyError::UnsupportedVersion(version[0], version[1])),
    };

    let mut header = vec![0u8; header_len];
    r.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    let descr = dict_value(&header, "descr")?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let width = match descr {
        "<f4" => 4,
        "<f8" => 8,
        other => return Err(NpyError::UnsupportedDtype(other.to_string())),
    };

    if dict_value(&header, "fortran_order")? != "False" {
        return Err(NpyError::Header("fortran_order arrays are not supported".into()));
    }

    let shape = dict_value(&header, "shape")?;
    let dims: Vec<&str> = shape
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let len: usize = match dims.as_slice() {
        [n] => n.parse().map_err(|_| NpyError::UnsupportedShape(shape.to_string()))?,
        _ => return Err(NpyError::UnsupportedShape(shape.to_string())),
    };

    let mut data = Vec::new();
    r.read_to_end(&mut data)?;
    let expected = len * width;
    if data.len() < expected {
        return Err(NpyError::Truncated { expected, actual: data.len() });
    }

    let values = if width == 4 {
        data[..expected]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    } else {
        data[..expected]
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect()
    };
    Ok(values)
}

/// Raw text of `'key': value` in the header dict, up to the next top-level comma.
fn dict_value<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let needle = format!("'{key}':");
    let start = header
        .find(&needle)
        .ok_or_else(|| NpyError::Header(format!("missing key {key}")))?
        + needle.len();
    let rest = header[start..].trim_start();

    let mut depth = 0i32;
    for (i, ch) in rest.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' | '}' if depth == 0 => return Ok(rest[..i].trim()),
            _ => {}
        }
    }
    Err(NpyError::Header(format!("unterminated value for {key}")))
}
