use std::time::{Duration, Instant};

use crate::{GenericTensorAccessor, ProfilingSettings, TaskError};

/// Run `f` under `settings`.
///
/// With profiling disabled `f` runs exactly once and no time is reported.
/// Otherwise it runs `warmup_iters` untimed and `measure_iters` timed
/// times, and the mean time in milliseconds is returned. `f` must overwrite
/// everything it writes; kernels that add into a buffer use
/// [`profile_accumulating`].
pub fn profile<F>(settings: &ProfilingSettings, label: &str, f: F) -> Result<Option<f32>, TaskError>
where
    F: FnMut() -> Result<(), TaskError>,
{
    profile_accumulating(settings, label, &[], f)
}

/// Like [`profile`], but `accumulators` are reset to their contents on entry
/// before every repeat, so the buffers end up as after a single run.
pub fn profile_accumulating<F>(
    settings: &ProfilingSettings,
    label: &str,
    accumulators: &[&GenericTensorAccessor],
    mut f: F,
) -> Result<Option<f32>, TaskError>
where
    F: FnMut() -> Result<(), TaskError>,
{
    if !settings.is_enabled() {
        f()?;
        return Ok(None);
    }
    let snapshots = accumulators
        .iter()
        .map(|t| t.snapshot())
        .collect::<Vec<_>>();
    let reset = || -> Result<(), TaskError> {
        for (t, saved) in accumulators.iter().zip(snapshots.iter()) {
            t.restore(saved)?;
        }
        Ok(())
    };

    for _ in 0..settings.warmup_iters {
        reset()?;
        f()?;
    }
    let mut elapsed = Duration::ZERO;
    for _ in 0..settings.measure_iters {
        reset()?;
        let start = Instant::now();
        f()?;
        elapsed += start.elapsed();
    }
    let elapsed_ms = elapsed.as_secs_f32() * 1e3 / settings.measure_iters as f32;
    log::debug!("{} = {:.2}ms", label, elapsed_ms);
    Ok(Some(elapsed_ms))
}
