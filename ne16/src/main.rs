use anyhow::{anyhow, Context};
use clap::Parser;
use kernel16::{
    config::KernelConfig,
    global::{handle_to_sel, GlobalFlags, GlobalHeap},
    kernel::{LoadParams, ModuleInfo},
    ne::{build_module, get_module, read_header, resource::ResourceEntry, NeHeader},
    ne::entry::Entry,
    Kernel,
};
use log::{info, warn, LevelFilter};
use serde::Serialize;
use std::{fs::read, path::PathBuf};

#[derive(Parser)]
struct Options {
    #[clap(long = "config")]
    /// kernel config file; built-in defaults when absent.
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: SubCommands,
}

#[derive(Parser)]
enum SubCommands {
    /// Print the tables of an NE image.
    Info {
        /// NE file
        exec: PathBuf,
        #[clap(long)]
        json: bool,
    },
    /// Load an image and the libraries it imports into a fresh kernel.
    Load {
        /// NE file
        exec: PathBuf,
        /// load without starting a task, as LoadLibrary does.
        #[clap(long)]
        lib: bool,
        /// command tail passed to the task.
        #[clap(long, default_value = "")]
        cmdline: String,
    },
    /// Add strings to a scratch atom table and print their atoms.
    Atoms { strings: Vec<String> },
}

#[derive(Serialize)]
struct SegmentInfo {
    number: u16,
    filepos: u16,
    size: u16,
    flags: u16,
    minsize: u16,
}

#[derive(Serialize)]
struct ImageInfo {
    path: String,
    name: String,
    header: NeHeader,
    segments: Vec<SegmentInfo>,
    entries: Vec<Entry>,
    resident_names: Vec<(String, u16)>,
    resources: Vec<ResourceEntry>,
}

fn image_info(config: &KernelConfig, path: &str, image: &[u8]) -> anyhow::Result<ImageInfo> {
    let (_, header) = read_header(image, path)?;
    let mut heap = GlobalHeap::new(&config.memory);
    let hmodule = build_module(&mut heap, image, path)?;
    let module = get_module(&heap, hmodule).ok_or_else(|| anyhow!("{}: module block vanished", path))?;
    let segments = module
        .segments()
        .iter()
        .enumerate()
        .map(|(i, s)| SegmentInfo {
            number: i as u16 + 1,
            filepos: s.filepos,
            size: s.size,
            flags: s.flags,
            minsize: s.minsize,
        })
        .collect();
    Ok(ImageInfo {
        path: path.to_string(),
        name: module.name(),
        header,
        segments,
        entries: module.entries(),
        resident_names: module.resident_names(),
        resources: module.resources(),
    })
}

fn print_info(info: &ImageInfo) {
    let h = &info.header;
    println!("{} ({})", info.name, info.path);
    println!(
        "  flags {:#06x}  expver {:#06x}  cs:ip {:04x}:{:04x}  ss:sp {:04x}:{:04x}  heap {:#x}  stack {:#x}",
        h.flags,
        h.expver,
        h.csip >> 16,
        h.csip & 0xffff,
        h.sssp >> 16,
        h.sssp & 0xffff,
        h.heap,
        h.stack
    );
    println!("segments:");
    for s in &info.segments {
        println!(
            "  {:3}  pos {:#06x}  size {:#06x}  min {:#06x}  flags {:#06x}",
            s.number, s.filepos, s.size, s.minsize, s.flags
        );
    }
    println!("entries:");
    for e in &info.entries {
        println!("  @{:<4} {:02x}:{:04x} flags {:02x}", e.ordinal, e.segnum, e.offset, e.flags);
    }
    println!("resident names:");
    for (name, ordinal) in &info.resident_names {
        println!("  {:<24} @{}", name, ordinal);
    }
    println!("resources:");
    for r in &info.resources {
        println!(
            "  {:#06x}  {} / {}  {:#x} bytes at {:#x}",
            r.hrsrc, r.type_id, r.name, r.size, r.file_offset
        );
    }
}

fn print_module(kernel: &Kernel, m: &ModuleInfo) {
    println!(
        "  {:#06x} {:<8} count {} flags {:#06x} instance {:#06x} {}",
        m.handle, m.name, m.count, m.flags, m.instance, m.file_name
    );
    for entry in kernel.global_entries().iter().filter(|e| e.owner == m.handle) {
        let sel = handle_to_sel(entry.handle);
        let head = kernel
            .segment_bytes(sel, entry.size.min(16) as usize)
            .map(hex::encode)
            .unwrap_or_default();
        println!(
            "      sel {:#06x} base {:#010x} size {:#07x} {}",
            sel, entry.base, entry.size, head
        );
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opts: Options = Options::parse();
    let mut config = match &opts.config_file {
        Some(path) => KernelConfig::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => KernelConfig::default(),
    };

    match opts.command {
        SubCommands::Info { exec, json } => {
            let image = read(&exec).with_context(|| format!("reading {}", exec.display()))?;
            let info = image_info(&config, &exec.to_string_lossy(), &image)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_info(&info);
            }
        }
        SubCommands::Load { exec, lib, cmdline } => {
            if let Some(dir) = exec.parent() {
                config.loader.search_path.insert(0, dir.to_path_buf());
            }
            let kernel = Kernel::new(config)?;
            let name = exec.to_string_lossy().into_owned();
            let loaded = if lib {
                kernel.load_library(&name)
            } else {
                let params = LoadParams {
                    cmdline: if cmdline.is_empty() { cmdline } else { format!(" {}", cmdline) },
                    ..Default::default()
                };
                kernel.load_module(&name, Some(&params))
            };
            match loaded {
                Ok(h) => info!("{} loaded, handle {:#06x}", name, h),
                Err(e) => warn!("{}: {} (code {})", name, e, e.legacy_code()),
            }
            println!("modules:");
            for m in kernel.modules() {
                print_module(&kernel, &m);
            }
            for task in kernel.tasks() {
                println!("task {:#06x} {} instance {:#06x}", task.handle, task.name, task.instance);
            }
        }
        SubCommands::Atoms { strings } => {
            let kernel = Kernel::new(config)?;
            let h = kernel.global_alloc(GlobalFlags::MOVEABLE | GlobalFlags::ZEROINIT, 0x2000);
            let ds = handle_to_sel(h);
            if h == 0 || !kernel.local_init(ds, 0, 0x1fff) {
                return Err(anyhow!("no scratch heap"));
            }
            kernel.init_atom_table(ds, 0);
            for s in &strings {
                let atom = kernel.add_atom(ds, s);
                let name = kernel.get_atom_name(ds, atom, 256).unwrap_or_default();
                println!("{:#06x} {}", atom, name);
            }
        }
    }
    Ok(())
}
