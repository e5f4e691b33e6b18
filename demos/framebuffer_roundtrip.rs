//! Map a framebuffer handed over by a display thread, fill a frame, and
//! tear everything down again.
//!
//! Run with: cargo run --example framebuffer_roundtrip
//! Set RUST_LOG=gralloc=trace to see every mapping step.

use gralloc::ipc::{recv_descriptor, send_descriptor};
use gralloc::{BufferDescriptor, Context, DisplayOutput, Rect, Usage};
use std::os::unix::net::UnixStream;
use std::thread;
use tracing_subscriber::EnvFilter;

const WIDTH: usize = 320;
const HEIGHT: usize = 240;
const FRAME: usize = WIDTH * HEIGHT * 4;
const FRAMES: usize = 2;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (display_end, client_end) = UnixStream::pair()?;

    // Stand-in for the display device: a memfd framebuffer with two frames
    let display = thread::spawn(move || -> gralloc::Result<()> {
        let fd = rustix::fs::memfd_create("fb0", rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, (FRAME * FRAMES) as u64)?;
        let desc = BufferDescriptor::framebuffer(fd, FRAME * FRAMES, FRAME);
        send_descriptor(&display_end, &desc)
    });

    let ctx = Context::new();
    let mut fb = recv_descriptor(&client_end)?;
    display.join().map_err(|_| "display thread panicked")??;

    ctx.register(&mut fb)?;
    let info = ctx
        .framebuffer(DisplayOutput::Primary)
        .ok_or("framebuffer not mapped")?;
    println!(
        "framebuffer: {} bytes, {} frames of {} bytes",
        info.size, info.num_buffers, info.frame_size
    );

    let slot = ctx.acquire_frame(DisplayOutput::Primary)?;
    ctx.lock(&mut fb, Usage::SW_WRITE_OFTEN, Rect::new(0, 0, WIDTH as i32, HEIGHT as i32))?;
    // SAFETY: the slot covers FRAME bytes of the live mapping.
    unsafe { slot.ptr.as_ptr().write_bytes(0xFF, FRAME) };
    ctx.unlock(&mut fb)?;
    println!("filled frame {} at offset {}", slot.index, slot.offset);

    ctx.release_frame(DisplayOutput::Primary, slot.index)?;
    ctx.unregister(&mut fb)?;
    println!("unregistered, base is {:?}", fb.base());

    Ok(())
}
