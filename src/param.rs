/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size. Matches the ext2 volume's 1 KiB blocks.
pub const BSIZE: usize = 1024;

/// Size of the disk block cache.
pub const NBUF: usize = 30;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of a process name, including the terminator.
pub const MAXPROCNAME: usize = 16;

/// Size of a process's kernel stack.
pub const KSTACKSIZE: usize = 4096;

/// Bytes in a pipe's ring buffer.
pub const PIPESIZE: usize = 512;

/// Size of the console input line buffer.
pub const INPUT_BUF: usize = 128;

/// Major number of the console device.
pub const CONSOLE_MAJOR: u16 = 1;
