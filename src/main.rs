#![recursion_limit = "256"]

use burn::backend::Autodiff;
use mnist_tracking::training::{self, RunConfig};

#[cfg(not(any(feature = "ndarray", feature = "wgpu")))]
compile_error!("Enable one backend feature: `ndarray` or `wgpu`.");

#[cfg(feature = "ndarray")]
mod backend {
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    pub type Selected = NdArray<f32>;

    pub fn device() -> NdArrayDevice {
        NdArrayDevice::Cpu
    }
}

#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
mod backend {
    use burn::backend::wgpu::{Wgpu, WgpuDevice};

    pub type Selected = Wgpu;

    pub fn device() -> WgpuDevice {
        WgpuDevice::default()
    }
}

fn main() {
    if let Err(err) = training::run::<Autodiff<backend::Selected>>(RunConfig::new(), backend::device())
    {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
