use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::http::{self, Response};

/// Turns a buffered request into the response for it.
///
/// Anything that goes wrong, from an unparseable request line to a missing or
/// unreadable file, is answered with [`Response::NotFound`].
pub fn respond(request: &[u8], root: &Path) -> Response {
    let Some(resource) = http::resource_path(request) else {
        debug!("unrecognised request line");
        return Response::NotFound;
    };

    let path = resolve(root, resource);
    match fs::read(&path) {
        Ok(contents) => Response::Found(contents),
        Err(err) => {
            debug!(path = %path.display(), "not found: {err}");
            Response::NotFound
        }
    }
}

/// Places `resource` under `root`.
///
/// This is plain concatenation: `..` components are kept as they are. Only
/// leading slashes are dropped so that an absolute-looking resource cannot
/// replace the root altogether.
pub fn resolve(root: &Path, resource: &str) -> PathBuf {
    root.join(resource.trim_start_matches('/'))
}
