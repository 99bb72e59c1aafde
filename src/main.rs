//! The `listfs-tool` utility creates and inspects ListFS volumes.

use listfs::disk::get_disk_size;
use listfs::layout::VERSION_MAJOR;
use listfs::layout::VERSION_MINOR;
use listfs::BlockIndex;
use listfs::FileDisk;
use listfs::ListFs;
use listfs::NodeFlags;
use std::env;
use std::fmt::Display;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::exit;

/// Content of the file seeding every fresh volume.
const README_TEXT: &[u8] = b"This is first file on your ListFS!\n";

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// The name of the current program used in command line.
    prog: String,
    /// If true, print command line help.
    help: bool,
    /// The path of the engine log file, if enabled.
    log_path: Option<PathBuf>,
    /// The action and its operands.
    action: Vec<String>,
}

fn parse_args() -> Args {
    let mut args: Args = Default::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "listfs-tool".to_owned());
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-l" | "--log" => args.log_path = iter.next().map(PathBuf::from),
            _ => args.action.push(arg),
        }
    }
    args
}

fn display_usage(prog: &str) {
    println!("ListFS Tool. Version {VERSION_MAJOR}.{VERSION_MINOR}");
    println!("Usage:");
    println!(
        "\t{prog} create <file or device name> <file system size in blocks>\n\t\t<block size> [bootloader file name]"
    );
    println!("\t{prog} dump <file or device name>");
    println!();
    println!("A size of 0 takes the volume size from the target device.");
    println!("Options:");
    println!("\t-l <file>\twrite the engine log to <file>");
}

/// Prints an error message and exits.
fn error(prog: &str, msg: impl Display) -> ! {
    eprintln!("{prog}: {msg}");
    exit(1);
}

/// Installs the `-l` log sink on the volume handle.
fn with_log(fs: ListFs<FileDisk>, args: &Args) -> ListFs<FileDisk> {
    let Some(path) = &args.log_path else {
        return fs;
    };
    let mut log_file = fs::File::create(path)
        .unwrap_or_else(|e| error(&args.prog, format!("{}: {e}", path.display())));
    fs.with_log(move |record| {
        let _ = writeln!(log_file, "{record}");
    })
}

fn create_action(args: &Args) {
    if args.action.len() < 4 {
        display_usage(&args.prog);
        exit(1);
    }
    let path = &args.action[1];
    let size: u64 = args.action[2]
        .parse()
        .unwrap_or_else(|_| error(&args.prog, "invalid file system size"));
    let block_size: u16 = args.action[3]
        .parse()
        .unwrap_or_else(|_| error(&args.prog, "invalid block size"));
    if block_size < 512 {
        error(&args.prog, "block size must be at least 512 bytes");
    }
    let bootloader = match args.action.get(4) {
        Some(boot_path) => {
            fs::read(boot_path).unwrap_or_else(|e| error(&args.prog, format!("{boot_path}: {e}")))
        }
        None => Vec::new(),
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .unwrap_or_else(|e| error(&args.prog, format!("{path}: {e}")));
    let size = if size == 0 {
        let sectors =
            get_disk_size(&file).unwrap_or_else(|e| error(&args.prog, format!("{path}: {e}")));
        sectors * 512 / block_size as u64
    } else {
        size
    };
    if size < 2 {
        error(&args.prog, "file system size too small");
    }

    let mut fs = with_log(ListFs::init(FileDisk::new(file)), args);
    fs.create(size, block_size, &bootloader);

    // Seed the volume with a README at the top level
    let node = fs
        .create_node("README", NodeFlags::empty(), BlockIndex::NONE)
        .unwrap_or_else(|e| error(&args.prog, e));
    let readme = fs.open_file(node).unwrap_or_else(|e| error(&args.prog, e));
    fs.file_write(&readme, README_TEXT);
    fs.close_file(readme);
    fs.close();
}

fn dump_action(args: &Args) {
    if args.action.len() < 2 {
        display_usage(&args.prog);
        exit(1);
    }
    let path = &args.action[1];
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap_or_else(|e| error(&args.prog, format!("{path}: {e}")));

    let mut fs = with_log(ListFs::init(FileDisk::new(file)), args);
    if let Err(e) = fs.open() {
        error(&args.prog, format!("{path}: {e}"));
    }

    let sb = fs.superblock();
    let version = sb.version;
    let base = sb.base;
    let size = sb.size;
    let map_base = sb.map_base;
    let map_size = sb.map_size;
    let block_size = sb.block_size;
    let used_blocks = sb.used_blocks;
    println!("ListFS information:");
    println!("\tVersion: {}.{}", version >> 8, version & 0xff);
    println!("\tBase: {base}");
    println!("\tSize: {size}");
    println!("\tBitmap base: {map_base}");
    println!("\tBitmap size: {map_size}");
    println!("\tBlock size: {block_size}");
    println!("\tUsed blocks count: {used_blocks}");

    println!("Nodes:");
    let root = fs.superblock().root_dir;
    dump_nodes(&mut fs, root, 1);
    fs.close();
}

/// Prints a sibling list and everything below it.
fn dump_nodes(fs: &mut ListFs<FileDisk>, first: BlockIndex, depth: usize) {
    let indent = "\t".repeat(depth);
    let nodes: Vec<_> = fs.nodes(first).collect();
    for (node, header) in nodes {
        let name = header.name();
        let flags = header.flags;
        let size = header.size;
        let data = header.data;
        println!(
            "{indent}Node {node} (name = '{name}', flags = {flags}, size = {size}, data = {data})"
        );
        if header.is_directory() {
            dump_nodes(fs, data, depth + 1);
        } else {
            dump_block_list(fs, data, &indent);
        }
    }
}

/// Prints a file's chain of block-list pages.
fn dump_block_list(fs: &mut ListFs<FileDisk>, list_block: BlockIndex, indent: &str) {
    let mut cur = list_block;
    while let Some(list) = fs.fetch_list(cur) {
        println!(
            "{indent}\tBlock list {cur} (next = {}, prev = {}):",
            list.next(),
            list.prev()
        );
        for block in list.data_blocks() {
            println!("{indent}\t\tBlock {block}");
        }
        cur = list.next();
    }
}

fn main() {
    let args = parse_args();
    if args.help || args.action.is_empty() {
        display_usage(&args.prog);
        return;
    }
    match args.action[0].as_str() {
        "create" => create_action(&args),
        "dump" => dump_action(&args),
        action => error(&args.prog, format!("unknown action `{action}`")),
    }
}
