use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Deterministic noise source for one generation.
///
/// Samples are drawn on the host from a seeded generator and moved to `device`, so a seed produces the same
/// latents on every backend.
pub struct SeededGenerator {
    rng: StdRng,
    device: Device,
}

impl SeededGenerator {
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    /// Standard normal samples of the given shape.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let data = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect::<Vec<_>>();
        Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(&self.device)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::SeededGenerator;

    #[test]
    fn same_seed_same_noise() -> candle_core::Result<()> {
        let a = SeededGenerator::new(10, &Device::Cpu).randn((1, 4, 2, 2), DType::F32)?;
        let b = SeededGenerator::new(10, &Device::Cpu).randn((1, 4, 2, 2), DType::F32)?;
        let c = SeededGenerator::new(11, &Device::Cpu).randn((1, 4, 2, 2), DType::F32)?;
        assert_eq!(a.dims(), &[1, 4, 2, 2]);
        assert_eq!(
            a.flatten_all()?.to_vec1::<f32>()?,
            b.flatten_all()?.to_vec1::<f32>()?
        );
        assert_ne!(
            a.flatten_all()?.to_vec1::<f32>()?,
            c.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }
}
