//! The block I/O gateway: the single choke point between the buffer cache
//! and the disk driver.
//!
//! On x86 the driver is the external IDE engine; on the host it is a RAM
//! image, which is also how the file-system stack gets tested.

use cfg_if::cfg_if;

use crate::bio::Buf;
use crate::param::BSIZE;

cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        use crate::arch;

        /// The hardware disk, reached through the IDE driver seam.
        pub struct Disk {
            _private: (),
        }

        impl Disk {
            pub const fn new() -> Self {
                Self { _private: () }
            }

            pub fn init(&self) {
                arch::ide_init();
            }

            /// Synchronize a locked buffer with the disk: write it out if
            /// dirty, read it in otherwise. On return the buffer is valid
            /// and clean.
            pub fn sync(&self, buf: &mut Buf) {
                let blockno = buf.blockno();
                let inner = buf.deref_inner_mut();
                assert!(
                    !(inner.valid && !inner.dirty),
                    "disk sync: nothing to do"
                );
                if inner.dirty {
                    // SAFETY: the buffer data is BSIZE bytes.
                    unsafe { arch::ide_write_block(blockno, inner.data.bytes().as_ptr()) };
                } else {
                    // SAFETY: the buffer data is BSIZE bytes.
                    unsafe { arch::ide_read_block(blockno, inner.data.bytes_mut().as_mut_ptr()) };
                }
                inner.valid = true;
                inner.dirty = false;
            }
        }
    } else {
        use crate::lock::Spinlock;

        /// A RAM-backed disk image standing in for the IDE engine.
        pub struct Disk {
            image: Spinlock<Option<&'static mut [u8]>>,
        }

        impl Disk {
            pub const fn new() -> Self {
                Self {
                    image: Spinlock::new("memdisk", None),
                }
            }

            pub fn init(&self) {}

            /// Install the backing image. Its length must be a multiple of
            /// the block size.
            pub fn set_image(&self, image: &'static mut [u8]) {
                assert_eq!(image.len() % BSIZE, 0);
                *self.image.lock() = Some(image);
            }

            pub fn sync(&self, buf: &mut Buf) {
                let mut guard = self.image.lock();
                let image = guard.as_mut().expect("memdisk: no image");
                let blockno = buf.blockno() as usize;
                let start = blockno * BSIZE;
                assert!(start + BSIZE <= image.len(), "memdisk: block out of range");

                let inner = buf.deref_inner_mut();
                assert!(
                    !(inner.valid && !inner.dirty),
                    "disk sync: nothing to do"
                );
                if inner.dirty {
                    image[start..start + BSIZE].copy_from_slice(inner.data.bytes());
                } else {
                    inner
                        .data
                        .bytes_mut()
                        .copy_from_slice(&image[start..start + BSIZE]);
                }
                inner.valid = true;
                inner.dirty = false;
            }
        }
    }
}
