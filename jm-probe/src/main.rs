use probe::{
    ProbeConfig, category_arena, category_jit, init_logging, outcome_label, run_arena_check,
    run_host_block_cache_check,
};
use tracing::{debug, error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let config = ProbeConfig::from_env()?;
    info!(
        segment_size = config.segment_size,
        alias_count = config.alias_count,
        link_blocks = config.link_blocks,
        code_size = config.code_size,
        "probe configuration"
    );

    let arena = run_arena_check(&config);
    match &arena {
        Ok(report) => {
            info!(
                "{} {} mechanism={} segment={:#x} hint={} constant_offset={}",
                category_arena(),
                outcome_label(true),
                report.mechanism,
                report.segment_size,
                report
                    .hint
                    .map(|base| format!("{base:#x}"))
                    .unwrap_or_else(|| "-".to_string()),
                report.constant_offset
            );
            for view in &report.views {
                info!(
                    "{}   {} at {:#x}{}",
                    category_arena(),
                    view.name,
                    view.address,
                    if view.relocated { " (relocated)" } else { "" }
                );
            }
        }
        Err(err) => error!("{} {} {err}", category_arena(), outcome_label(false)),
    }

    let cache = run_host_block_cache_check(&config);
    match &cache {
        Some(Ok(report)) => {
            info!(
                "{} {} patcher={} code={:#x} blocks={} invalidated={} cleared={} links={} unlinks={}",
                category_jit(),
                outcome_label(true),
                report.patcher,
                report.code_base,
                report.blocks,
                report.invalidated,
                report.cleared,
                report.stats.link_patches,
                report.stats.unlink_patches
            );
            debug!("{}", report.dump);
        }
        Some(Err(err)) => error!("{} {} {err}", category_jit(), outcome_label(false)),
        None => info!(
            "{} skipped: no exit patcher for {}",
            category_jit(),
            std::env::consts::ARCH
        ),
    }

    arena?;
    if let Some(cache) = cache {
        cache?;
    }
    Ok(())
}
