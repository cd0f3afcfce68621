//! Moving forward inputs onto the engine device.
//!
//! The root of an invocation moves its input before the module runs,
//! recursing through tuples, vectors and options so nested tensors land on
//! the device too.

use crate::utils::error::Result;
use candle_core::{Device, Tensor};

pub trait ToDevice: Sized {
    fn move_to_device(self, device: &Device) -> Result<Self>;
}

impl ToDevice for Tensor {
    fn move_to_device(self, device: &Device) -> Result<Self> {
        if self.device().same_device(device) {
            return Ok(self);
        }
        Ok(Tensor::to_device(&self, device)?)
    }
}

impl ToDevice for () {
    fn move_to_device(self, _device: &Device) -> Result<Self> {
        Ok(())
    }
}

impl<T: ToDevice> ToDevice for Option<T> {
    fn move_to_device(self, device: &Device) -> Result<Self> {
        self.map(|v| v.move_to_device(device)).transpose()
    }
}

impl<T: ToDevice> ToDevice for Vec<T> {
    fn move_to_device(self, device: &Device) -> Result<Self> {
        self.into_iter().map(|v| v.move_to_device(device)).collect()
    }
}

macro_rules! impl_to_device_tuple {
    ($($name:ident),+) => {
        impl<$($name: ToDevice),+> ToDevice for ($($name,)+) {
            #[allow(non_snake_case)]
            fn move_to_device(self, device: &Device) -> Result<Self> {
                let ($($name,)+) = self;
                Ok(($($name.move_to_device(device)?,)+))
            }
        }
    };
}

impl_to_device_tuple!(A);
impl_to_device_tuple!(A, B);
impl_to_device_tuple!(A, B, C);
impl_to_device_tuple!(A, B, C, D);
