//! WGSL compilation with shader defs.
//!
//! Kernel sources are composed with `naga_oil` so the compiler can emit
//! `#ifdef`-guarded variants (half precision, weight access method) from a
//! single source. Compiled modules are cached: layers of the same kind and
//! shape typically share their kernel text.

use crate::error::{GraphError, Result};
use naga_oil::compose::{Composer, NagaModuleDescriptor, ShaderDefValue};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

/// Shader def set by the engine when intermediate tensors are 16-bit.
pub const HALF_PRECISION_DEF: &str = "HALF_PRECISION";

/// Convert string defines into `naga_oil` shader defs.
///
/// Values that parse as integers become `Int`, everything else is a
/// `Bool` that is true only for the literal `"true"`.
pub fn shader_defs(defines: &HashMap<String, String>) -> HashMap<String, ShaderDefValue> {
    defines
        .iter()
        .map(|(k, v)| {
            if let Ok(int_val) = v.parse::<i32>() {
                (k.clone(), ShaderDefValue::Int(int_val))
            } else {
                (k.clone(), ShaderDefValue::Bool(v == "true"))
            }
        })
        .collect()
}

/// Compose and validate one WGSL source into a naga module.
///
/// # Errors
/// Returns [`GraphError::ShaderCompilation`] with the composer's message.
pub fn compile_wgsl(
    label: &str,
    source: &str,
    defines: &HashMap<String, String>,
) -> Result<naga::Module> {
    let mut composer = Composer::default();
    composer
        .make_naga_module(NagaModuleDescriptor {
            source,
            file_path: label,
            shader_defs: shader_defs(defines),
            ..Default::default()
        })
        .map_err(|e| GraphError::ShaderCompilation(format!("'{label}': {e}")))
}

/// Cache of compiled modules keyed by source text and defines.
#[derive(Default)]
pub struct ShaderCache {
    modules: HashMap<u64, naga::Module>,
    hits: usize,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached module for `source` + `defines`, compiling it on a miss.
    pub fn get_or_compile(
        &mut self,
        label: &str,
        source: &str,
        defines: &HashMap<String, String>,
    ) -> Result<&naga::Module> {
        let key = cache_key(source, defines);
        if self.modules.contains_key(&key) {
            self.hits += 1;
            tracing::trace!(label, "shader cache hit");
        } else {
            let module = compile_wgsl(label, source, defines)?;
            self.modules.insert(key, module);
        }
        self.modules
            .get(&key)
            .ok_or_else(|| GraphError::ShaderCompilation(format!("'{label}': cache miss after insert")))
    }

    /// Number of distinct modules compiled.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

fn cache_key(source: &str, defines: &HashMap<String, String>) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    // Sorted so that HashMap iteration order does not matter.
    let sorted: BTreeMap<_, _> = defines.iter().collect();
    sorted.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const COPY_KERNEL: &str = r#"
@group(0) @binding(0) var<storage, read> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
#ifdef DOUBLE
    dst[id.x] = src[id.x] * 2.0;
#else
    dst[id.x] = src[id.x];
#endif
}
"#;

    #[test]
    fn test_compile_wgsl_finds_entry_point() {
        let module = compile_wgsl("copy", COPY_KERNEL, &HashMap::new()).unwrap();
        assert!(module.entry_points.iter().any(|ep| ep.name == "main"));
        let bound = module
            .global_variables
            .iter()
            .filter(|(_, v)| v.binding.is_some())
            .count();
        assert_eq!(bound, 2);
    }

    #[test]
    fn test_invalid_source_is_reported() {
        let err = compile_wgsl("broken", "fn main( {", &HashMap::new()).unwrap_err();
        assert!(matches!(err, GraphError::ShaderCompilation(ref msg) if msg.contains("broken")));
    }

    #[test]
    fn test_shader_defs_conversion() {
        let mut defines = HashMap::new();
        defines.insert("TILE".to_string(), "16".to_string());
        defines.insert(HALF_PRECISION_DEF.to_string(), "true".to_string());
        defines.insert("OFF".to_string(), "no".to_string());
        let defs = shader_defs(&defines);
        assert_eq!(defs["TILE"], ShaderDefValue::Int(16));
        assert_eq!(defs[HALF_PRECISION_DEF], ShaderDefValue::Bool(true));
        assert_eq!(defs["OFF"], ShaderDefValue::Bool(false));
    }

    #[test]
    fn test_cache_reuses_identical_sources() {
        let mut cache = ShaderCache::new();
        let mut doubled = HashMap::new();
        doubled.insert("DOUBLE".to_string(), "true".to_string());

        cache.get_or_compile("a", COPY_KERNEL, &HashMap::new()).unwrap();
        cache.get_or_compile("b", COPY_KERNEL, &HashMap::new()).unwrap();
        cache.get_or_compile("c", COPY_KERNEL, &doubled).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 1);
    }
}
