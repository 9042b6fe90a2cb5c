#[cfg(test)]
pub(crate) mod tests {
    use candle_core::{DType, Device};

    /// Get devices to test on that support the given data type.
    ///
    /// Gradient checks run in double precision, which is not available on
    /// Metal devices.
    pub fn test_devices(dtype: DType) -> Vec<Device> {
        let mut devices = vec![Device::Cpu];

        if let Ok(device) = Device::new_cuda(0) {
            devices.push(device);
        }

        if dtype != DType::F64 {
            if let Ok(device) = Device::new_metal(0) {
                devices.push(device);
            }
        }

        devices
    }
}
