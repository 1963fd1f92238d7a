// colors.rs — Colour conversion on the compute backend.
//
// Frames usually arrive as RGBA. Every other stage reads intensity from the
// red channel, so colour input is converted once up front: BT.601 luma
// (0.299 R + 0.587 G + 0.114 B) written into r, g and b, alpha kept.

use crate::backend::{ComputeBackend, KernelArg, KernelSettings, KernelSpec, Texture};
use crate::error::Result;
use crate::program::ProgramGroup;

pub struct ColorConverter {
    program: ProgramGroup,
}

impl Default for ColorConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorConverter {
    pub fn new() -> Self {
        let mut program = ProgramGroup::new("colors");
        program.declare(
            "rgb2grey",
            KernelSpec::new("colors/rgb2grey").with_arguments(&["image"]),
            KernelSettings::default(),
        );
        ColorConverter { program }
    }

    /// Greyscale copy of `image`, owned by the converter.
    pub fn to_greyscale(
        &mut self,
        backend: &mut dyn ComputeBackend,
        image: Texture,
    ) -> Result<Texture> {
        self.program
            .call(backend, "rgb2grey", &[KernelArg::Texture(image)])
    }
}
