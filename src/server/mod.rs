mod router;
mod state;

pub use router::{build_router, parse_render_path};
pub use state::{AppState, ServeHealth};
