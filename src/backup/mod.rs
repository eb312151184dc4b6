pub mod archive;
pub mod config;
pub mod game;
pub mod result_error;
pub mod retention;
pub mod scheduler;
pub mod settings;
pub mod shutdown;
pub mod slots;
pub mod special;
pub mod state;
pub mod validate;
pub mod zip;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
