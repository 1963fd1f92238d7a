// program.rs — Named kernel groups with lazy instantiation and pipelines.
//
// A `ProgramGroup` is a table of kernel declarations plus pipelines built
// from them. Nothing touches the backend until a kernel is first used; the
// instantiated `KernelId`s are then cached by name for the lifetime of the
// group.
//
//   let mut g = ProgramGroup::new("pyramids");
//   g.declare("smoothX", spec, KernelSettings::default());
//   g.compose("reduce", &["smoothX", "smoothY", "downsample2"]);
//   let out = g.run(backend, "reduce", image, &[])?;
//
// Using a name that was never declared is a programming error and panics.
//
// NEW RUST CONCEPTS:
// - `&mut dyn Trait` parameters: the group does not care which backend it
//   drives, and does not own it.
// - `HashMap::entry` would hold a mutable borrow across the backend call, so
//   the cache is checked and filled in two steps instead.

use std::collections::HashMap;

use crate::backend::{ComputeBackend, KernelArg, KernelId, KernelSettings, KernelSpec, Texture};
use crate::error::Result;

/// An ordered list of kernel names. Running it feeds each stage's output
/// into the next stage's first argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<&'static str>,
}

/// A named group of kernel declarations.
pub struct ProgramGroup {
    name: &'static str,
    declarations: HashMap<&'static str, (KernelSpec, KernelSettings)>,
    pipelines: HashMap<&'static str, Pipeline>,
    kernels: HashMap<&'static str, KernelId>,
}

impl ProgramGroup {
    pub fn new(name: &'static str) -> Self {
        ProgramGroup {
            name,
            declarations: HashMap::new(),
            pipelines: HashMap::new(),
            kernels: HashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a kernel. Redeclaring a name replaces it, and drops any
    /// cached instance so the new declaration takes effect on next use.
    pub fn declare(
        &mut self,
        name: &'static str,
        spec: KernelSpec,
        settings: KernelSettings,
    ) -> &mut Self {
        self.kernels.remove(name);
        self.declarations.insert(name, (spec, settings));
        self
    }

    /// Register a pipeline of previously declared kernels.
    ///
    /// # Panics
    /// Panics if a stage names an undeclared kernel or the list is empty.
    pub fn compose(&mut self, name: &'static str, stages: &[&'static str]) -> &mut Self {
        assert!(!stages.is_empty(), "pipeline `{}/{name}` has no stages", self.name);
        for stage in stages {
            assert!(
                self.declarations.contains_key(stage),
                "pipeline `{}/{name}` uses undeclared kernel `{stage}`",
                self.name
            );
        }
        self.pipelines.insert(
            name,
            Pipeline {
                stages: stages.to_vec(),
            },
        );
        self
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.get(name)
    }

    /// Settings a kernel was declared with.
    ///
    /// # Panics
    /// Panics if `name` was never declared.
    pub fn settings(&self, name: &str) -> KernelSettings {
        self.declaration(name).1
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declarations.contains_key(name)
    }

    /// Whether the kernel has been created on the backend yet.
    pub fn is_instantiated(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    fn declared_name(&self, name: &str) -> &'static str {
        match self.declarations.get_key_value(name) {
            Some((key, _)) => key,
            None => panic!("kernel `{}/{name}` was never declared", self.name),
        }
    }

    fn declaration(&self, name: &str) -> &(KernelSpec, KernelSettings) {
        match self.declarations.get(name) {
            Some(d) => d,
            None => panic!("kernel `{}/{name}` was never declared", self.name),
        }
    }

    /// Instantiate on first use, then reuse.
    fn kernel(&mut self, backend: &mut dyn ComputeBackend, name: &str) -> Result<KernelId> {
        if let Some(&id) = self.kernels.get(name) {
            return Ok(id);
        }
        let (key, (spec, settings)) = match self.declarations.get_key_value(name) {
            Some(entry) => entry,
            None => panic!("kernel `{}/{name}` was never declared", self.name),
        };
        let id = backend.create_kernel(&format!("{}/{}", self.name, key), spec, settings)?;
        let key = *key;
        self.kernels.insert(key, id);
        Ok(id)
    }

    /// Invoke a single kernel.
    pub fn call(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        args: &[KernelArg<'_>],
    ) -> Result<Texture> {
        let id = self.kernel(backend, name)?;
        backend.invoke(id, args)
    }

    /// Run a pipeline (or a single kernel, if `name` is not a pipeline) on
    /// `image`, appending `extra` to every stage's arguments.
    ///
    /// Caller-owned intermediates produced by non-recycling stages are
    /// released on the way; `image` itself never is.
    pub fn run(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        image: Texture,
        extra: &[KernelArg<'_>],
    ) -> Result<Texture> {
        let stages = match self.pipelines.get(name) {
            Some(p) => p.stages.clone(),
            None => vec![self.declared_name(name)],
        };

        let mut current = image;
        let mut owned = false;
        for stage in stages {
            let mut args = Vec::with_capacity(extra.len() + 1);
            args.push(KernelArg::Texture(current));
            args.extend_from_slice(extra);
            let out = self.call(backend, stage, &args)?;
            if owned {
                backend.release(current)?;
            }
            owned = !self.settings(stage).recycle_texture;
            current = out;
        }
        Ok(current)
    }

    /// Fix a kernel's output size.
    pub fn resize(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let id = self.kernel(backend, name)?;
        backend.resize(id, width, height)
    }

    /// Fill a kernel's output texture with `color`.
    pub fn clear(
        &mut self,
        backend: &mut dyn ComputeBackend,
        name: &str,
        color: [f32; 4],
    ) -> Result<Texture> {
        let id = self.kernel(backend, name)?;
        backend.clear(id, color)
    }
}
