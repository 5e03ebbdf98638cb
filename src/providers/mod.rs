pub mod madara;
pub mod mangadex;

use std::sync::Arc;

use crate::engine::Engine;
use crate::error::Result;

/// Register MangaDex and every Madara site listed in the configuration
pub fn register_builtin(engine: &Engine) -> Result<()> {
    let services = engine.services().clone();
    engine.register_provider(Arc::new(mangadex::MangaDex::new(services.clone())))?;

    for site in &engine.config().providers.madara {
        log::info!("Registering madara site {} ({})", site.id, site.base_url);
        engine.register_provider(Arc::new(madara::Madara::new(site.clone(), services.clone())))?;
    }
    Ok(())
}
