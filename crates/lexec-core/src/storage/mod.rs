mod cpu_buffer;

pub use cpu_buffer::*;
