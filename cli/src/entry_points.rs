use crate::arg_parser::Entry;
use batchlib::{ItemContext, LocalBackend, LocalConfig};

impl Entry {
    pub fn name(self) -> &'static str {
        match self {
            Entry::Square => "square",
            Entry::CubeRoot => "cube_root",
            Entry::Flaky => "flaky",
        }
    }
}

/// The local pool with every built-in entry point registered.
pub fn local_backend(config: LocalConfig) -> LocalBackend {
    LocalBackend::builder()
        .config(config)
        .register(Entry::Square.name(), |x: f64| async move { Ok::<_, String>(x * x) })
        .register(Entry::CubeRoot.name(), |x: f64| async move {
            Ok::<_, String>(x.cbrt())
        })
        .register_with_context(Entry::Flaky.name(), |ctx: ItemContext, x: f64| async move {
            if ctx.index % 2 == 0 && ctx.attempt == 1 {
                Err(format!("item {} lost its spot instance", ctx.index))
            } else {
                Ok(x)
            }
        })
        .build()
}
