//! Weight Files
//!
//! Model weights are stored as a flat little-endian stream with no header.
//! Each parameter is written in the model's fixed parameter order:
//!
//! ```text
//! matrix: i32 rows, i32 cols, rows*cols × f32 (row-major)
//! vector: i32 len,            len × f32
//! ```
//!
//! The stream carries no architecture description, so the reader is given
//! the expected shape of every parameter and rejects anything else. A short
//! stream surfaces as an `Io` error (`UnexpectedEof`).

use crate::error::{Result, ViolaError};
use crate::tensor::Tensor;
use std::io::{Read, Write};

/// Writes parameters to a byte stream.
pub struct WeightWriter<W: Write> {
    inner: W,
}

impl<W: Write> WeightWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    fn write_i32(&mut self, value: usize) -> Result<()> {
        let value = i32::try_from(value).map_err(|_| {
            ViolaError::WeightMismatch(format!("dimension {} does not fit in an i32", value))
        })?;
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn write_values(&mut self, data: &[f32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for &val in data {
            bytes.extend_from_slice(&val.to_le_bytes());
        }
        self.inner.write_all(&bytes)?;
        Ok(())
    }

    /// Write a parameter, as a matrix or a vector depending on its rank.
    pub fn write_tensor(&mut self, tensor: &Tensor) -> Result<()> {
        match tensor.shape.as_slice() {
            [len] => self.write_i32(*len)?,
            [rows, cols] => {
                self.write_i32(*rows)?;
                self.write_i32(*cols)?;
            }
            other => {
                return Err(ViolaError::WeightMismatch(format!(
                    "cannot store a tensor of shape {:?}",
                    other
                )))
            }
        }
        self.write_values(&tensor.data)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads parameters from a byte stream, validating every dimension.
pub struct WeightReader<R: Read> {
    inner: R,
}

impl<R: Read> WeightReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_dim(&mut self, what: &str) -> Result<usize> {
        let mut bytes = [0u8; 4];
        self.inner.read_exact(&mut bytes)?;
        let value = i32::from_le_bytes(bytes);
        usize::try_from(value).map_err(|_| {
            ViolaError::WeightMismatch(format!("{}: negative dimension {}", what, value))
        })
    }

    fn read_values(&mut self, count: usize) -> Result<Vec<f32>> {
        let mut bytes = vec![0u8; count * 4];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Read a parameter that must have exactly `expected` shape.
    pub fn read_tensor(&mut self, expected: &[usize], what: &str) -> Result<Tensor> {
        let mut shape = Vec::with_capacity(expected.len());
        for _ in expected {
            shape.push(self.read_dim(what)?);
        }
        if shape != expected {
            return Err(ViolaError::WeightMismatch(format!(
                "{}: stored shape {:?}, expected {:?}",
                what, shape, expected
            )));
        }
        let data = self.read_values(expected.iter().product())?;
        Tensor::new(data, shape)
    }

    /// Fail unless the stream is exhausted.
    pub fn finish(mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte)? {
            0 => Ok(()),
            _ => Err(ViolaError::WeightMismatch(
                "trailing data after the last parameter".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_matrix_layout() {
        let tensor = Tensor::from_rows(&[vec![1.0, 2.0]]).unwrap();
        let mut writer = WeightWriter::new(Vec::new());
        writer.write_tensor(&tensor).unwrap();
        let bytes = writer.into_inner();

        let mut expected = Vec::new();
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.extend_from_slice(&2i32.to_le_bytes());
        expected.extend_from_slice(&1.0f32.to_le_bytes());
        expected.extend_from_slice(&2.0f32.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_vector_roundtrip() {
        let tensor = Tensor::new(vec![0.5, -0.25, 3.0], vec![3]).unwrap();
        let mut writer = WeightWriter::new(Vec::new());
        writer.write_tensor(&tensor).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 4 + 3 * 4);

        let mut reader = WeightReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_tensor(&[3], "gamma").unwrap(), tensor);
        reader.finish().unwrap();
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut writer = WeightWriter::new(Vec::new());
        writer.write_tensor(&Tensor::zeros(2, 3)).unwrap();
        let mut reader = WeightReader::new(Cursor::new(writer.into_inner()));
        assert!(matches!(
            reader.read_tensor(&[3, 2], "w"),
            Err(ViolaError::WeightMismatch(_))
        ));
    }

    #[test]
    fn test_negative_dimension_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        let mut reader = WeightReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_tensor(&[4], "beta"),
            Err(ViolaError::WeightMismatch(_))
        ));
    }

    #[test]
    fn test_truncated_stream_is_io_error() {
        let mut writer = WeightWriter::new(Vec::new());
        writer.write_tensor(&Tensor::zeros(2, 2)).unwrap();
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 3);
        let mut reader = WeightReader::new(Cursor::new(bytes));
        assert!(matches!(reader.read_tensor(&[2, 2], "w"), Err(ViolaError::Io(_))));
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut writer = WeightWriter::new(Vec::new());
        writer.write_tensor(&Tensor::filled_vector(1, 1.0)).unwrap();
        let mut bytes = writer.into_inner();
        bytes.push(0);
        let mut reader = WeightReader::new(Cursor::new(bytes));
        reader.read_tensor(&[1], "v").unwrap();
        assert!(reader.finish().is_err());
    }
}
