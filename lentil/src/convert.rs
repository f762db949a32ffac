use candle_core::{DType, Device, Result, Tensor};
use ndarray::Array2;

/// Move dense host matrices in and out of candle
pub trait ConvertTensorOps: Sized {
    fn to_tensor(&self, dtype: DType, dev: &Device) -> Result<Tensor>;
    fn from_tensor(x: &Tensor) -> Result<Self>;
}

impl ConvertTensorOps for Array2<f64> {
    fn to_tensor(&self, dtype: DType, dev: &Device) -> Result<Tensor> {
        let (nrow, ncol) = self.dim();
        // iter() is in logical (row-major) order regardless of layout
        let data: Vec<f64> = self.iter().copied().collect();
        Tensor::from_vec(data, (nrow, ncol), &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(dev)
    }

    fn from_tensor(x: &Tensor) -> Result<Self> {
        let (nrow, ncol) = x.dims2()?;
        let data = x
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;
        Array2::from_shape_vec((nrow, ncol), data).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
