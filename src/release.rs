//! First-error-wins bookkeeping for scoped releases.

use anyhow::Result;

/// Combine the outcome of some work with the outcome of releasing the resource it used.
///
/// The release has already been attempted by the time this is called. If the work failed,
/// its error is returned and the release error (if any) is only logged; otherwise the
/// release error becomes the result.
pub fn first_error<T>(primary: Result<T>, release: Result<()>) -> Result<T> {
    match (primary, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            log::warn!("discarding release error after earlier failure: {release_err:#}");
            Err(err)
        }
    }
}
