pub mod push_image;
