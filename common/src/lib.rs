pub mod bool_ext;
pub mod log_setup;
pub mod normalize_string;

pub use bool_ext::BoolExt;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
