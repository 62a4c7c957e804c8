use std::{ffi::CStr, process::ExitCode};

use heapyard::Allocator;

fn main() -> ExitCode {
    env_logger::init();

    let mut allocator = Allocator::new();
    let message = b"Hello, world!\0";

    let address = match allocator.allocate(message.len()) {
        Ok(address) => address,
        Err(err) => {
            eprintln!("allocation failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    unsafe {
        address.as_ptr().copy_from(message.as_ptr(), message.len());
        let text = CStr::from_ptr(address.as_ptr().cast());
        println!("Message: {}", text.to_string_lossy());

        allocator.deallocate(address);
    }

    let statistics = allocator.statistics();
    println!("[Allocator Statistics]");
    println!("Pages Mapped -> {}", statistics.pages_mapped);
    println!("Pages Unmapped -> {}", statistics.pages_unmapped);
    println!("Chunks Allocated -> {}", statistics.chunks_allocated);
    println!("Chunks Freed -> {}", statistics.chunks_freed);
    println!("Free Chunks -> {}", statistics.free_length);

    allocator.destroy();

    ExitCode::SUCCESS
}
