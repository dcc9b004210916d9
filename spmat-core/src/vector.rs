use crate::device::{Device, DeviceSet, Stream};
use crate::error::{Result, SpmvError};
use crate::traits::{Real, Vector};
use std::fmt::Debug;
use std::sync::Arc;

/// A vector split into contiguous parts, one per device of a `DeviceSet`.
///
/// Part `d` covers `[partition[d], partition[d + 1])` and lives in a buffer on
/// device `d`. The partition is the one the set produces for the vector
/// length, so a vector of length `cols` lines up with a matrix's columns and
/// one of length `rows` with its rows.
#[derive(Debug)]
pub struct DistVector<T: Real, D: Device> {
    devices: Vec<Arc<D>>,
    parts: Vec<D::Buffer<T>>,
    partition: Vec<usize>,
}

impl<T: Real, D: Device> DistVector<T, D> {
    /// Creates a vector holding a copy of `data`.
    pub fn from_slice(set: &DeviceSet<D>, data: &[T]) -> Result<Self> {
        let partition = set.partition_of(data.len())?;
        let parts = set
            .devices()
            .iter()
            .enumerate()
            .map(|(d, device)| {
                device.create_buffer_init(
                    &format!("vector part {}", d),
                    &data[partition[d]..partition[d + 1]],
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            devices: set.devices().to_vec(),
            parts,
            partition,
        })
    }

    /// Creates a zero vector of length `len`.
    pub fn zeros(set: &DeviceSet<D>, len: usize) -> Result<Self> {
        let partition = set.partition_of(len)?;
        let parts = set
            .devices()
            .iter()
            .enumerate()
            .map(|(d, device)| {
                device.create_buffer(
                    &format!("vector part {}", d),
                    partition[d + 1] - partition[d],
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            devices: set.devices().to_vec(),
            parts,
            partition,
        })
    }

    pub fn len(&self) -> usize {
        self.partition.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partition(&self) -> &[usize] {
        &self.partition
    }

    /// The buffer holding part `d`.
    pub fn part(&self, d: usize) -> &D::Buffer<T> {
        &self.parts[d]
    }

    pub fn device(&self, d: usize) -> &Arc<D> {
        &self.devices[d]
    }

    /// Reads the whole vector back to the host.
    ///
    /// Reads are queued on every device before the first one is awaited.
    pub async fn read(&self) -> Result<Vec<T>> {
        let pending: Vec<_> = self
            .devices
            .iter()
            .zip(&self.parts)
            .map(|(device, part)| device.enqueue_read(Stream::Primary, part, &[]))
            .collect();

        let mut out = Vec::with_capacity(self.len());
        for read in pending {
            out.extend(read.await?);
        }
        Ok(out)
    }

    /// Overwrites the vector with `data`.
    pub fn write(&mut self, data: &[T]) -> Result<()> {
        if data.len() != self.len() {
            return Err(SpmvError::InvalidDimensions(format!(
                "Data length ({}) does not match vector length ({})",
                data.len(),
                self.len()
            )));
        }
        for (d, (device, part)) in self.devices.iter().zip(&self.parts).enumerate() {
            let slice = &data[self.partition[d]..self.partition[d + 1]];
            if !slice.is_empty() {
                device.enqueue_write(Stream::Primary, part, slice, &[])?;
            }
        }
        Ok(())
    }
}

impl<T: Real, D: Device> Vector for DistVector<T, D> {
    type Value = T;

    fn len(&self) -> usize {
        DistVector::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CpuDeviceConfig, PartitionConfig};
    use crate::device::CpuDevice;

    fn set(count: usize) -> DeviceSet<CpuDevice> {
        let devices = (0..count)
            .map(|_| CpuDevice::new(CpuDeviceConfig::default()).unwrap())
            .collect();
        DeviceSet::new(devices)
            .unwrap()
            .with_partition(PartitionConfig::with_alignment(1))
    }

    #[test]
    fn test_from_slice_and_read() {
        let set = set(3);
        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let v = DistVector::from_slice(&set, &data).unwrap();
        assert_eq!(v.len(), 10);
        assert_eq!(v.partition(), set.partition_of(10).unwrap().as_slice());
        assert_eq!(CpuDevice::buffer_len(v.part(0)), v.partition()[1]);
        assert_eq!(pollster::block_on(v.read()).unwrap(), data);
    }

    #[test]
    fn test_zeros_and_write() {
        let set = set(2);
        let mut v = DistVector::<f64, _>::zeros(&set, 5).unwrap();
        assert_eq!(pollster::block_on(v.read()).unwrap(), vec![0.0; 5]);

        v.write(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(
            pollster::block_on(v.read()).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0]
        );
        assert!(matches!(
            v.write(&[1.0]),
            Err(SpmvError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_empty_vector() {
        let set = set(2);
        let v = DistVector::<f64, _>::zeros(&set, 0).unwrap();
        assert!(v.is_empty());
        assert!(pollster::block_on(v.read()).unwrap().is_empty());
    }
}
