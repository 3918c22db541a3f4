//! Reader for flat vector files: `u32 count`, `u32 dim`, then `count * dim`
//! little-endian f32 values.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Vectors read from a file, stored row-major.
#[derive(Debug)]
pub struct VectorFile {
    pub dimension: usize,
    pub data: Vec<f32>,
}

impl VectorFile {
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.max(1))
    }
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_vectors(path: &Path) -> io::Result<VectorFile> {
    let mut reader = BufReader::new(File::open(path)?);
    let count = read_u32(&mut reader)? as usize;
    let dimension = read_u32(&mut reader)? as usize;
    if dimension == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: dimension is zero", path.display()),
        ));
    }
    let values = count.checked_mul(dimension).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "vector count overflows")
    })?;

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() != values * 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{}: expected {count} x {dimension} floats ({} bytes), found {} bytes",
                path.display(),
                values * 4,
                bytes.len()
            ),
        ));
    }
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(VectorFile { dimension, data })
}
