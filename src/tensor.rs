use crate::shape::DataType;
use half::f16;
use num_traits::AsPrimitive;
use thiserror::Error;

#[derive(Error, Debug, Eq, PartialEq)]
#[error("{len} bytes do not hold a whole number of {data_type} elements")]
pub struct DataError {
    pub data_type: DataType,
    pub len: usize,
}

fn cast_from_f64<T: Copy + 'static>(values: &[f64]) -> Vec<T>
where
    f64: AsPrimitive<T>,
{
    values.iter().map(|v| v.as_()).collect()
}

fn cast_to_f64<T: AsPrimitive<f64>>(values: &[T]) -> Vec<f64> {
    values.iter().map(|v| v.as_()).collect()
}

/// Typed host copy of a tensor's bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum HostData {
    Float32(Vec<f32>),
    Float16(Vec<f16>),
    Int32(Vec<i32>),
    Uint32(Vec<u32>),
    Int64(Vec<i64>),
    Uint64(Vec<u64>),
    Int8(Vec<i8>),
    Uint8(Vec<u8>),
}

impl HostData {
    pub fn from_bytes(data_type: DataType, bytes: &[u8]) -> Result<Self, DataError> {
        if bytes.len() as u64 % data_type.size_in_bytes() != 0 {
            return Err(DataError {
                data_type,
                len: bytes.len(),
            });
        }
        // pod_collect_to_vec copies, so the source needs no particular alignment
        Ok(match data_type {
            DataType::Float32 => HostData::Float32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Float16 => HostData::Float16(
                bytemuck::pod_collect_to_vec::<u8, u16>(bytes)
                    .into_iter()
                    .map(f16::from_bits)
                    .collect(),
            ),
            DataType::Int32 => HostData::Int32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Uint32 => HostData::Uint32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Int64 => HostData::Int64(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Uint64 => HostData::Uint64(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Int8 => HostData::Int8(bytemuck::pod_collect_to_vec(bytes)),
            DataType::Uint8 => HostData::Uint8(bytes.to_vec()),
        })
    }

    /// Converts with `as` semantics: float to integer truncates toward zero
    /// and saturates at the type bounds.
    /// Converts with `as` semantics: float to integer truncates toward zero
    /// and saturates at the type bounds.
    pub fn from_f64(data_type: DataType, values: &[f64]) -> Self {
        match data_type {
            DataType::Float32 => HostData::Float32(cast_from_f64(values)),
            DataType::Float16 => HostData::Float16(values.iter().map(|&v| f16::from_f64(v)).collect()),
            DataType::Int32 => HostData::Int32(cast_from_f64(values)),
            DataType::Uint32 => HostData::Uint32(cast_from_f64(values)),
            DataType::Int64 => HostData::Int64(cast_from_f64(values)),
            DataType::Uint64 => HostData::Uint64(cast_from_f64(values)),
            DataType::Int8 => HostData::Int8(cast_from_f64(values)),
            DataType::Uint8 => HostData::Uint8(cast_from_f64(values)),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            HostData::Float32(_) => DataType::Float32,
            HostData::Float16(_) => DataType::Float16,
            HostData::Int32(_) => DataType::Int32,
            HostData::Uint32(_) => DataType::Uint32,
            HostData::Int64(_) => DataType::Int64,
            HostData::Uint64(_) => DataType::Uint64,
            HostData::Int8(_) => DataType::Int8,
            HostData::Uint8(_) => DataType::Uint8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::Float32(v) => v.len(),
            HostData::Float16(v) => v.len(),
            HostData::Int32(v) => v.len(),
            HostData::Uint32(v) => v.len(),
            HostData::Int64(v) => v.len(),
            HostData::Uint64(v) => v.len(),
            HostData::Int8(v) => v.len(),
            HostData::Uint8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            HostData::Float32(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::Float16(v) => v.iter().flat_map(|h| h.to_bits().to_ne_bytes()).collect(),
            HostData::Int32(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::Uint32(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::Int64(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::Uint64(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::Int8(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::Uint8(v) => v.clone(),
        }
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            HostData::Float32(v) => cast_to_f64(v),
            HostData::Float16(v) => v.iter().map(|x| x.to_f64()).collect(),
            HostData::Int32(v) => cast_to_f64(v),
            HostData::Uint32(v) => cast_to_f64(v),
            HostData::Int64(v) => cast_to_f64(v),
            HostData::Uint64(v) => cast_to_f64(v),
            HostData::Int8(v) => cast_to_f64(v),
            HostData::Uint8(v) => cast_to_f64(v),
        }
    }
}

/// Reads the element at `index` (counted in elements) from a raw byte buffer.
pub fn read_element(data_type: DataType, bytes: &[u8], index: u64) -> f64 {
    let size = data_type.size_in_bytes() as usize;
    let start = index as usize * size;
    let raw = &bytes[start..start + size];
    match data_type {
        DataType::Float32 => bytemuck::pod_read_unaligned::<f32>(raw) as f64,
        DataType::Float16 => f16::from_bits(bytemuck::pod_read_unaligned::<u16>(raw)).to_f64(),
        DataType::Int32 => bytemuck::pod_read_unaligned::<i32>(raw) as f64,
        DataType::Uint32 => bytemuck::pod_read_unaligned::<u32>(raw) as f64,
        DataType::Int64 => bytemuck::pod_read_unaligned::<i64>(raw) as f64,
        DataType::Uint64 => bytemuck::pod_read_unaligned::<u64>(raw) as f64,
        DataType::Int8 => raw[0] as i8 as f64,
        DataType::Uint8 => raw[0] as f64,
    }
}

/// Writes `value` at `index` (counted in elements), converting like
/// [`HostData::from_f64`].
pub fn write_element(data_type: DataType, bytes: &mut [u8], index: u64, value: f64) {
    let size = data_type.size_in_bytes() as usize;
    let start = index as usize * size;
    let raw = &mut bytes[start..start + size];
    match data_type {
        DataType::Float32 => raw.copy_from_slice(&(value as f32).to_ne_bytes()),
        DataType::Float16 => raw.copy_from_slice(&f16::from_f64(value).to_bits().to_ne_bytes()),
        DataType::Int32 => raw.copy_from_slice(&(value as i32).to_ne_bytes()),
        DataType::Uint32 => raw.copy_from_slice(&(value as u32).to_ne_bytes()),
        DataType::Int64 => raw.copy_from_slice(&(value as i64).to_ne_bytes()),
        DataType::Uint64 => raw.copy_from_slice(&(value as u64).to_ne_bytes()),
        DataType::Int8 => raw[0] = value as i8 as u8,
        DataType::Uint8 => raw[0] = value as u8,
    }
}

/// Shorthand for `HostData::from_f64(..).to_bytes()`.
pub fn encode(data_type: DataType, values: &[f64]) -> Vec<u8> {
    HostData::from_f64(data_type, values).to_bytes()
}

pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Vec<f64>, DataError> {
    Ok(HostData::from_bytes(data_type, bytes)?.to_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_data_bytes() {
        let data = HostData::Float32(vec![1.0, -2.5, 3.25]);
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(HostData::from_bytes(DataType::Float32, &bytes).unwrap(), data);

        // unaligned source slice
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(HostData::from_bytes(DataType::Float32, &shifted[1..]).unwrap(), data);
    }

    #[test]
    fn test_host_data_rejects_partial_elements() {
        let err = HostData::from_bytes(DataType::Int32, &[0u8; 6]).unwrap_err();
        assert_eq!(err.len, 6);
    }

    #[test]
    fn test_float16() {
        let bytes = encode(DataType::Float16, &[0.5, -1.0, 2048.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(decode(DataType::Float16, &bytes).unwrap(), vec![0.5, -1.0, 2048.0]);
    }

    #[test]
    fn test_integer_conversion() {
        let data = HostData::from_f64(DataType::Uint8, &[-3.0, 1.9, 300.0]);
        assert_eq!(data, HostData::Uint8(vec![0, 1, 255]));

        let data = HostData::from_f64(DataType::Int32, &[-1.7, 2.7]);
        assert_eq!(data, HostData::Int32(vec![-1, 2]));
    }

    #[test]
    fn test_read_write_element() {
        let mut bytes = vec![0u8; 3 * 8];
        write_element(DataType::Int64, &mut bytes, 2, -42.0);
        write_element(DataType::Int64, &mut bytes, 0, 7.0);
        assert_eq!(read_element(DataType::Int64, &bytes, 0), 7.0);
        assert_eq!(read_element(DataType::Int64, &bytes, 1), 0.0);
        assert_eq!(read_element(DataType::Int64, &bytes, 2), -42.0);

        let mut bytes = vec![0u8; 2];
        write_element(DataType::Int8, &mut bytes, 1, -5.0);
        assert_eq!(read_element(DataType::Int8, &bytes, 1), -5.0);
    }
}
