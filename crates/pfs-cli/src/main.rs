#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use packfs::stream::{
    FileDataSink, FileDataSource, NullDataSink, RandomDataSource, read_stream, write_stream,
};
use packfs::{FileSnap, FsOptions, Filesystem};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::error;

#[derive(Parser)]
#[command(name = "pfs", about = "PackFS — embedded object store demo driver")]
struct Cli {
    /// Directory holding the volume files.
    #[arg(long, short = 'd', default_value = "./data")]
    data_dir: PathBuf,

    /// Number of block groups (backing files).
    #[arg(long, default_value_t = 32)]
    groups: u32,

    /// Blocks per group (0 = default 1,048,576).
    #[arg(long, default_value_t = 0)]
    blocks_in_group: u32,

    /// Shard id embedded into file UIDs.
    #[arg(long, default_value_t = 1)]
    shard: u16,

    /// Disable atomic 64-block allocation (on by default).
    #[arg(long)]
    no_big_alloc: bool,

    /// Verbose logging.
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show store-wide and per-group usage.
    Info,
    /// List every live file.
    List {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Import a host file or directory tree.
    Put {
        /// File or directory to import.
        path: PathBuf,
    },
    /// Export one file by UID.
    Get {
        uid: String,
        /// Destination directory.
        #[arg(long, short = 'o', default_value = ".")]
        out: PathBuf,
    },
    /// Export every live file.
    Export {
        /// Destination directory.
        #[arg(long, short = 'o')]
        out: PathBuf,
    },
    /// Delete one file by UID.
    Del { uid: String },
    /// Delete every live file.
    Erase,
    /// Write one large random file for performance testing.
    Fill {
        /// Size in MiB.
        size_mb: u64,
    },
    /// Render block-bitmap occupancy as a heat map.
    Graph {
        /// Number of groups to draw.
        #[arg(long, default_value_t = 8)]
        limit: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.data_dir)?;
    let mut fs = Filesystem::open(FsOptions {
        group_num: cli.groups,
        blocks_in_group: cli.blocks_in_group,
        root: cli.data_dir.clone(),
        pattern: None,
        tpl: None,
        shard_id: cli.shard,
        enable_big_alloc: !cli.no_big_alloc,
    })
    .context("open filesystem")?;

    let start = Instant::now();
    match cli.command {
        Command::Info => print_info(&fs),
        Command::List { json } => {
            let list = fs.file_list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                print_file_list(&list);
            }
        }
        Command::Put { path } => put_path(&mut fs, &path)?,
        Command::Get { uid, out } => {
            let mut sink = FileDataSink::new(&out, None, false);
            let (read, _, _) = read_stream(&mut fs, &uid, &mut sink, 1024 * 1024)?;
            println!("exported {} ({})", uid, format_bytes(read));
        }
        Command::Export { out } => {
            for snap in fs.file_list()? {
                let mut sink = FileDataSink::new(&out, None, false);
                let (read, _, _) = read_stream(&mut fs, &snap.key, &mut sink, 1024 * 1024)?;
                println!("exported {} {} ({})", snap.key, snap.name, format_bytes(read));
            }
        }
        Command::Del { uid } => {
            fs.delete_file(&uid)?;
            println!("deleted {uid}");
        }
        Command::Erase => {
            for snap in fs.file_list()? {
                if let Err(err) = fs.delete_file(&snap.key) {
                    error!(key = %snap.key, name = %snap.name, %err, "delete failed");
                    bail!("erase aborted at {}", snap.key);
                }
            }
            println!("erased all files");
        }
        Command::Fill { size_mb } => fill_large_file(&mut fs, size_mb)?,
        Command::Graph { limit } => draw_graph(&fs, limit),
    }
    println!("cmd cost: {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn print_info(fs: &Filesystem) {
    let sb = fs.superblock();
    let (tb, fb) = fs.stat_blocks(None);
    let (ti, fi) = fs.stat_inodes(None);
    println!("== FS INFO ==");
    println!("total groups: {}", sb.total_groups);
    println!("total space:  {} GB", sb.total_space() / (1024 * 1024 * 1024));
    println!("block size:   {}", sb.block_size);
    println!("blocks [{:>9}/{:<9}]", tb - fb, tb);
    println!("inodes [{:>9}/{:<9}]", ti - fi, ti);
    println!();
    println!("== GROUP INFO ==");
    println!("{:<4} {:<15} {:<18} {:<18} SIZE", "ID", "FNAME", "INODES", "BLOCKS");
    for idx in 0..sb.total_groups as usize {
        let Some(vol) = fs.volume(idx) else { continue };
        if !vol.is_ready() {
            continue;
        }
        let (tb, fb) = fs.stat_blocks(Some(idx));
        let (ti, fi) = fs.stat_inodes(Some(idx));
        println!(
            "{:03}  {:<15} {:<18} {:<18} {}",
            vol.id,
            vol.file_name,
            format!("{}/{}", ti - fi, ti),
            format!("{}/{}", tb - fb, tb),
            format_bytes(vol.size_bytes()),
        );
    }
}

fn print_file_list(list: &[FileSnap]) {
    for snap in list {
        println!(
            "{:<8x} {:<30} {:<10} {:<12} {}",
            snap.inode,
            snap.key,
            format_bytes(snap.size),
            snap.ctime,
            snap.name,
        );
    }
}

fn put_file(fs: &mut Filesystem, root: &Path, rel: &Path) -> Result<()> {
    let name = rel.to_string_lossy().into_owned();
    let mut source = FileDataSource::open(root.join(rel), 1024 * 1024, true)?;
    let (key, written, _, _) = write_stream(fs, &mut source, &name, &[])?;
    println!("{key} {name} ({})", format_bytes(written));
    Ok(())
}

fn put_path(fs: &mut Filesystem, path: &Path) -> Result<()> {
    if path.is_file() {
        let root = path.parent().unwrap_or(Path::new("."));
        let rel = path.strip_prefix(root).unwrap_or(path);
        return put_file(fs, root, rel);
    }
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(entry_path);
            } else {
                let rel = entry_path.strip_prefix(path).unwrap_or(&entry_path);
                put_file(fs, path, rel)?;
            }
        }
    }
    Ok(())
}

fn fill_large_file(fs: &mut Filesystem, size_mb: u64) -> Result<()> {
    let total = size_mb * 1024 * 1024;
    let mut source = RandomDataSource::new(50 * 1024 * 1024, total, false, true);
    let (key, written, crc_w, vfile) = write_stream(fs, &mut source, "test.file", &[])?;
    vfile.sync(fs)?;
    println!("wrote {} as {key}", format_bytes(written));

    let mut sink = NullDataSink::new(true);
    let (read, crc_r, _) = read_stream(fs, &key, &mut sink, 50 * 1024 * 1024)?;
    if written != read || crc_w != crc_r {
        bail!("verification failed: wrote {written}B crc {crc_w:#x}, read {read}B crc {crc_r:#x}");
    }
    println!("verified {} (crc {:#010x})", format_bytes(read), crc_r);
    Ok(())
}

// ── Heat map ────────────────────────────────────────────────────────────────

const HEATMAP_WIDTH: usize = 128;

fn draw_graph(fs: &Filesystem, limit: usize) {
    let groups = (fs.superblock().total_groups as usize).min(limit);
    for idx in 0..groups {
        if let Some(bitmap) = fs.block_bitmap_bytes(idx) {
            draw_heatmap(bitmap);
        }
    }
}

fn occupancy(cell: &[u8]) -> f32 {
    if cell.is_empty() {
        return 0.0;
    }
    let used: u32 = cell.iter().map(|b| b.count_ones()).sum();
    used as f32 / (cell.len() * 8) as f32
}

fn draw_heatmap(bitmap: &[u8]) {
    let cell_size = (bitmap.len() / HEATMAP_WIDTH).max(1);
    for col in 0..HEATMAP_WIDTH {
        let start = col * cell_size;
        if start >= bitmap.len() {
            break;
        }
        let cell = &bitmap[start..(start + cell_size).min(bitmap.len())];
        let heat = occupancy(cell);
        if heat < 0.0001 {
            print!("█");
        } else if heat < 0.2 {
            print!("\x1b[92m█\x1b[0m");
        } else if heat < 0.6 {
            print!("\x1b[38;5;226m█\x1b[0m");
        } else if heat < 0.85 {
            print!("\x1b[38;5;214m█\x1b[0m");
        } else {
            print!("\x1b[31m█\x1b[0m");
        }
    }
    println!();
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[0])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}
