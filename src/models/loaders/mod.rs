pub mod photo_loader;

pub use photo_loader::load_photo_items;
