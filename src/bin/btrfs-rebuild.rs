//! `btrfs-rebuild` CLI (spec.md §6 "CLI surface"): thin glue over the
//! library, preserving the subcommand/flag/exit-code contract spec.md
//! specifies without reimplementing any recovery logic here.
//!
//! Grounded on the teacher's own `main.rs`: `clap::Parser` with
//! `env_logger::init()` and a top-level `anyhow::Result<()>` main. The
//! teacher only ever had one flat command; this generalizes that into the
//! `inspect <subcommand>` tree spec.md lists, and turns any error into the
//! `"<argv0>: error: <message>\n"` stderr line and exit code 1 spec.md
//! requires instead of anyhow's default multi-line chain.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use btrfs_rebuild::addr::{DeviceID, LogicalAddr, ObjID};
use btrfs_rebuild::device::{DeviceFile, DeviceSet};
use btrfs_rebuild::fingerprint::ChecksumKind;
use btrfs_rebuild::forest::{Forest, MapNodeSource, SystemRoots};
use btrfs_rebuild::graph::Graph;
use btrfs_rebuild::node::{read_node, Node, NodeBody, NodeExpectations};
use btrfs_rebuild::scanner::{scan_all_devices, CancelToken, ScanConfig, ScanResult};
use btrfs_rebuild::structures::SuperBlock;
use btrfs_rebuild::volume::{Mapping, StripeMapping, Volume};
use btrfs_rebuild::{json, superblock};

#[derive(Parser)]
#[command(name = "btrfs-rebuild", author, version, about = "Read-only recovery engine for damaged BTRFS-family images")]
struct Cli {
    /// Physical-volume image paths, one per device (repeatable).
    #[arg(long = "pv", required = true)]
    pv: Vec<PathBuf>,

    /// A prior mappings JSON to seed the volume mapper with.
    #[arg(long = "mappings")]
    mappings: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long = "verbosity", default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: TopCommand,
}

#[derive(Subcommand)]
enum TopCommand {
    /// Read-only inspection and recovery subcommands.
    Inspect {
        #[command(subcommand)]
        cmd: InspectCommand,
    },
}

#[derive(Subcommand)]
enum InspectCommand {
    /// Writes a human-readable tree dump to stdout.
    DumpTrees,
    /// Counts items per tree plus a lost+found bucket of unvisited nodes.
    LsTrees {
        #[arg(long = "node-list")]
        node_list: Option<PathBuf>,
    },
    /// Walks the fs tree as a file hierarchy.
    LsFiles,
    /// Chunk-table reconstruction (spec.md §4.4).
    RebuildMappings {
        #[command(subcommand)]
        phase: RebuildMappingsPhase,
    },
    /// Rebuilt-forest construction (spec.md §4.6).
    RebuildTrees {
        #[arg(long = "node-list")]
        node_list: Option<PathBuf>,
    },
    /// Mounts a read-only file view on a local path.
    Mount {
        mountpoint: PathBuf,
        #[arg(long = "skip-filesums")]
        skip_filesums: bool,
    },
}

#[derive(Subcommand)]
enum RebuildMappingsPhase {
    /// I/O phase: scans every device, writes scan results JSON to stdout.
    Scan,
    /// CPU phase: reads scan results JSON from stdin, writes mappings JSON.
    Process,
    /// Writes the node list JSON for whatever scan results are on stdin.
    ListNodes,
}

fn main() {
    let cli = Cli::parse();
    let argv0 = std::env::args().next().unwrap_or_else(|| "btrfs-rebuild".to_string());

    env_logger::Builder::new()
        .filter_level(parse_verbosity(&cli.verbosity))
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("{}: error: {}", argv0, e);
        std::process::exit(1);
    }
}

fn parse_verbosity(v: &str) -> log::LevelFilter {
    match v {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        TopCommand::Inspect { cmd } => run_inspect(cli, cmd),
    }
}

fn open_devices(paths: &[PathBuf]) -> anyhow::Result<DeviceSet> {
    let mut devices = DeviceSet::new();
    for (i, path) in paths.iter().enumerate() {
        let dev = DeviceFile::open(path)?;
        devices.insert(DeviceID::new(i as i64 + 1), dev);
    }
    Ok(devices)
}

fn load_superblock(devices: &DeviceSet) -> anyhow::Result<SuperBlock> {
    devices
        .ids()
        .filter_map(|id| devices.get(id).and_then(superblock::read_best))
        .max_by_key(|sb| sb.generation)
        .ok_or_else(|| anyhow::anyhow!("no valid superblock found on any --pv device"))
}

/// Builds the starting [`Volume`] from a superblock's embedded system chunk
/// array, optionally layering in a prior mappings JSON (spec.md §4.1
/// bootstrap, §6 `--mappings`).
fn bootstrap_volume<'d>(devices: &'d DeviceSet, sb: &SuperBlock, mappings_path: Option<&PathBuf>) -> anyhow::Result<Volume<'d>> {
    let mut volume = Volume::new(devices);
    for chunk in superblock::system_chunks(sb)? {
        let stripes = chunk
            .stripes
            .iter()
            .map(|s| StripeMapping {
                device: DeviceID::from(s.devid),
                physical: btrfs_rebuild::addr::PhysicalAddr::from(s.offset),
            })
            .collect();
        let mapping = Mapping {
            logical_start: LogicalAddr::from(chunk.key.offset),
            length: chunk.header.length,
            stripes,
            chunk_type: chunk.header.chunk_type,
        };
        if let Err(e) = volume.add_mapping(mapping) {
            log::warn!("system chunk array: dropping conflicting entry: {}", e);
        }
    }
    if let Some(path) = mappings_path {
        let text = std::fs::read_to_string(path)?;
        let rows: Vec<json::MappingRow> = serde_json::from_str(&text)?;
        for e in json::apply_mapping_rows(&mut volume, rows) {
            log::warn!("--mappings: dropping conflicting entry: {}", e);
        }
    }
    Ok(volume)
}

fn checksum_kind_of(sb: &SuperBlock) -> ChecksumKind {
    sb.checksum_kind().unwrap_or(ChecksumKind::Crc32c)
}

fn scan_config(sb: &SuperBlock) -> ScanConfig {
    ScanConfig {
        fs_uuid: btrfs_rebuild::uuid::Uuid::from_bytes(sb.fsid),
        checksum_kind: checksum_kind_of(sb),
        sector_size: sb.sectorsize as u64,
        node_size: sb.nodesize as u64,
    }
}

fn run_scan(devices: &DeviceSet, cfg: &ScanConfig) -> anyhow::Result<HashMap<DeviceID, ScanResult>> {
    let cancel = CancelToken::new();
    let mut out = HashMap::new();
    for (id, result) in scan_all_devices(devices, cfg, &cancel) {
        out.insert(id, result?);
    }
    Ok(out)
}

/// Re-walks every device sector-by-sector, same as [`scanner::scan_device`],
/// but keeps the fully decoded [`Node`] for each hit rather than only its
/// summary, since the rebuilt forest needs real item bodies to index
/// (spec.md §4.6). Kept local to the CLI rather than folded into
/// `scanner.rs`, whose `ScanResult` contract is shared with the JSON wire
/// format and already has its own round-trip tests.
fn scan_into_graph(devices: &DeviceSet, sb: &SuperBlock, cfg: &ScanConfig) -> (Graph, HashMap<LogicalAddr, Arc<Node>>) {
    let mut graph = Graph::new();
    graph.seed_from_superblock(sb);
    let mut nodes: HashMap<LogicalAddr, Arc<Node>> = HashMap::new();

    for dev_id in devices.ids() {
        let dev = devices.get(dev_id).expect("id came from devices.ids()");
        let dev_len = dev.len();
        let mut paddr = 0u64;
        let mut min_next_node = 0u64;
        while paddr < dev_len {
            let in_superblock = btrfs_rebuild::structures::BTRFS_SUPER_MIRROR_OFFSETS.iter().any(|&sb| {
                let sb_end = sb + btrfs_rebuild::structures::BTRFS_SUPER_INFO_SIZE as u64;
                paddr < sb_end && paddr + cfg.node_size > sb
            });
            if paddr >= min_next_node && !in_superblock && paddr + cfg.node_size <= dev_len {
                if let Ok(buf) = dev.slice(paddr, cfg.node_size as usize) {
                    if let Ok(node) = read_node(
                        buf,
                        cfg.fs_uuid,
                        cfg.checksum_kind,
                        cfg.sector_size,
                        LogicalAddr::new(paddr as i64),
                        &NodeExpectations::none(),
                    ) {
                        graph.insert_node(&node);
                        nodes.insert(node.addr, Arc::new(node));
                        min_next_node = paddr + cfg.node_size;
                    }
                }
            }
            paddr += cfg.sector_size;
        }
    }
    (graph, nodes)
}

fn build_forest<'g, 'n>(graph: &'g Graph, sb: &SuperBlock, nodes: &'n MapNodeSource) -> anyhow::Result<Forest<'g, 'n>> {
    Ok(Forest::new(graph, SystemRoots::from_superblock(sb), nodes))
}

fn run_inspect(cli: &Cli, cmd: &InspectCommand) -> anyhow::Result<()> {
    let devices = open_devices(&cli.pv)?;
    let sb = load_superblock(&devices)?;

    match cmd {
        InspectCommand::DumpTrees => cmd_dump_trees(&devices, &sb),
        InspectCommand::LsTrees { node_list } => cmd_ls_trees(&devices, &sb, node_list.as_ref()),
        InspectCommand::LsFiles => cmd_ls_files(&devices, &sb),
        InspectCommand::RebuildMappings { phase } => cmd_rebuild_mappings(cli, &devices, &sb, phase),
        InspectCommand::RebuildTrees { node_list } => cmd_rebuild_trees(&devices, &sb, node_list.as_ref()),
        InspectCommand::Mount { mountpoint, skip_filesums } => cmd_mount(cli, &devices, &sb, mountpoint, *skip_filesums),
    }
}

fn cmd_dump_trees(devices: &DeviceSet, sb: &SuperBlock) -> anyhow::Result<()> {
    let cfg = scan_config(sb);
    let (graph, nodes) = scan_into_graph(devices, sb, &cfg);
    let source = MapNodeSource(nodes);
    let forest = build_forest(&graph, sb, &source)?;

    for tree_id in discover_tree_ids(&forest) {
        let Ok(tree) = forest.tree(tree_id) else { continue };
        println!("tree {}", tree_id.as_u64());
        forest.tree_walk(
            &tree,
            |key, item| println!("  {:?} {:?}", key, item_summary(&item)),
            |key, cause| println!("  {:?} <bad item: {}>", key, cause),
        );
    }
    Ok(())
}

fn item_summary(item: &btrfs_rebuild::node::LeafItem) -> String {
    use btrfs_rebuild::items::ItemBody;
    match &item.body {
        ItemBody::Inode(i) => format!("inode size={} mode={:#o}", i.size, i.mode),
        ItemBody::DirList(entries) => format!("dir entries={}", entries.len()),
        ItemBody::Root(r) => format!("root bytenr={:#x} level={}", r.bytenr, r.level),
        ItemBody::Chunk { header, .. } => format!("chunk length={:#x} type={:#x}", header.length, header.chunk_type),
        ItemBody::DevExtent(d) => format!("dev_extent chunk_offset={:#x} length={:#x}", d.chunk_offset, d.length),
        ItemBody::BlockGroup(b) => format!("block_group used={:#x} flags={:#x}", b.used, b.flags),
        ItemBody::FileExtent(f) => match f {
            btrfs_rebuild::structures::FileExtent::Inline { header, data } => {
                format!("file_extent inline ram_bytes={} data_len={}", header.ram_bytes, data.len())
            }
            btrfs_rebuild::structures::FileExtent::Reg { header, descriptor } => {
                format!("file_extent reg ram_bytes={} num_bytes={}", header.ram_bytes, descriptor.num_bytes)
            }
            btrfs_rebuild::structures::FileExtent::Prealloc { header, descriptor } => {
                format!("file_extent prealloc ram_bytes={} num_bytes={}", header.ram_bytes, descriptor.num_bytes)
            }
        },
        ItemBody::Error { cause } => format!("error: {}", cause),
        _ => "…".to_string(),
    }
}

/// Every tree id `inspect` commands should visit: the system trees plus
/// every `ROOT_ITEM` key found under the root tree.
fn discover_tree_ids(forest: &Forest) -> Vec<ObjID> {
    let mut ids = vec![ObjID::ROOT_TREE, ObjID::CHUNK_TREE, ObjID::TREE_LOG, ObjID::FS_TREE];
    if let Ok(root_tree) = forest.tree(ObjID::ROOT_TREE) {
        forest.tree_subrange(
            &root_tree,
            |k| k.item_type == 0x84, // ROOT_ITEM
            |k, _| ids.push(k.objectid),
        );
    }
    ids.sort();
    ids.dedup();
    ids
}

fn cmd_ls_trees(devices: &DeviceSet, sb: &SuperBlock, node_list: Option<&PathBuf>) -> anyhow::Result<()> {
    let cfg = scan_config(sb);
    let (graph, nodes) = scan_into_graph(devices, sb, &cfg);
    if let Some(path) = node_list {
        let addrs: Vec<LogicalAddr> = graph.leaves().collect();
        std::fs::write(path, serde_json::to_string_pretty(&addrs)?)?;
    }
    let source = MapNodeSource(nodes);
    let forest = build_forest(&graph, sb, &source)?;

    let mut all_roots: std::collections::HashSet<LogicalAddr> = std::collections::HashSet::new();
    for tree_id in discover_tree_ids(&forest) {
        let Ok(tree) = forest.tree(tree_id) else { continue };
        let mut count = 0usize;
        forest.tree_range(&tree, |_, _| count += 1);
        all_roots.extend(tree.read().roots.iter().copied());
        println!("{}\t{}", tree_id.as_u64(), count);
    }

    // A leaf belongs to some discovered tree iff one of its backward-reachable
    // roots (leafToRoots) is among the roots every discovered tree claims;
    // anything else is unreferenced by anything `discover_tree_ids` found.
    let lost_and_found = graph
        .leaves()
        .filter(|leaf| forest.leaf_to_roots(*leaf).is_disjoint(&all_roots))
        .count();
    println!("lost+found\t{}", lost_and_found);
    Ok(())
}

fn cmd_ls_files(devices: &DeviceSet, sb: &SuperBlock) -> anyhow::Result<()> {
    use btrfs_rebuild::items::ItemBody;

    let cfg = scan_config(sb);
    let (graph, nodes) = scan_into_graph(devices, sb, &cfg);
    let source = MapNodeSource(nodes);
    let forest = build_forest(&graph, sb, &source)?;
    let tree = forest.tree(ObjID::FS_TREE)?;

    const DIR_ITEM: u8 = 0x54;
    const DIR_INDEX: u8 = 0x60;
    forest.tree_subrange(
        &tree,
        |k| k.item_type == DIR_ITEM || k.item_type == DIR_INDEX,
        |key, item| {
            if let ItemBody::DirList(entries) = &item.body {
                for e in entries {
                    println!("{}\t{}", key.objectid.as_u64(), String::from_utf8_lossy(&e.name));
                }
            }
        },
    );
    Ok(())
}

fn cmd_rebuild_mappings(cli: &Cli, devices: &DeviceSet, sb: &SuperBlock, phase: &RebuildMappingsPhase) -> anyhow::Result<()> {
    let cfg = scan_config(sb);
    match phase {
        RebuildMappingsPhase::Scan => {
            let results = run_scan(devices, &cfg)?;
            let doc = json::scan_results_to_json(&results);
            println!("{}", serde_json::to_string(&doc)?);
        }
        RebuildMappingsPhase::Process => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            let doc: std::collections::BTreeMap<String, json::DeviceScanJson> = serde_json::from_str(&text)?;
            let scans = json::scan_results_from_json(&doc);

            let mut volume = bootstrap_volume(devices, sb, cli.mappings.as_ref())?;
            let fs_size = sb.total_bytes;
            let stats = btrfs_rebuild::reconstruct::reconstruct(&mut volume, &scans, checksum_kind_of(sb), fs_size);
            log::info!(
                "reconstruct: {} chunk items, {} dev extents, {} block groups matched, {} matchsum blocks",
                stats.chunk_items_applied,
                stats.dev_extents_applied,
                stats.block_groups_matched,
                stats.matchsum_blocks_recovered
            );
            let rows = json::mappings_to_rows(&volume);
            println!("{}", serde_json::to_string(&rows)?);
        }
        RebuildMappingsPhase::ListNodes => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            let doc: std::collections::BTreeMap<String, json::DeviceScanJson> = serde_json::from_str(&text)?;
            let scans = json::scan_results_from_json(&doc);
            let mut addrs: Vec<LogicalAddr> = scans
                .values()
                .flat_map(|s| s.found_nodes.iter().map(|n| n.addr))
                .collect();
            addrs.sort();
            addrs.dedup();
            println!("{}", serde_json::to_string(&addrs)?);
        }
    }
    Ok(())
}

fn cmd_rebuild_trees(devices: &DeviceSet, sb: &SuperBlock, node_list: Option<&PathBuf>) -> anyhow::Result<()> {
    let cfg = scan_config(sb);
    let (mut graph, nodes) = scan_into_graph(devices, sb, &cfg);

    if let Err(e) = graph.final_check(|addr| {
        for dev_id in devices.ids() {
            let dev = devices.get(dev_id).expect("id came from devices.ids()");
            if addr.as_u64() + cfg.node_size > dev.len() {
                continue;
            }
            if let Ok(buf) = dev.slice(addr.as_u64(), cfg.node_size as usize) {
                if let Ok(node) = read_node(buf, cfg.fs_uuid, cfg.checksum_kind, cfg.sector_size, addr, &NodeExpectations::none()) {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }) {
        eprintln!("rebuild-trees: graph consistency check failed: {}", e);
        return Err(e.into());
    }

    if let Some(path) = node_list {
        let addrs: Vec<LogicalAddr> = graph.leaves().collect();
        std::fs::write(path, serde_json::to_string_pretty(&addrs)?)?;
    }

    let source = MapNodeSource(nodes);
    let forest = build_forest(&graph, sb, &source)?;

    let mut roots_doc = std::collections::BTreeMap::new();
    let mut any_error = false;
    for tree_id in discover_tree_ids(&forest) {
        match forest.tree(tree_id) {
            Ok(tree) => {
                let mut addrs: Vec<LogicalAddr> = tree.read().roots.iter().copied().collect();
                addrs.sort();
                roots_doc.insert(tree_id.as_u64().to_string(), addrs);
            }
            Err(e) => {
                eprintln!("rebuild-trees: tree {}: {}", tree_id.as_u64(), e);
                any_error = true;
            }
        }
    }
    println!("{}", serde_json::to_string_pretty(&roots_doc)?);
    if any_error {
        anyhow::bail!("one or more trees failed to rebuild");
    }
    Ok(())
}

#[cfg(feature = "mount")]
fn cmd_mount(cli: &Cli, devices: &DeviceSet, sb: &SuperBlock, mountpoint: &PathBuf, skip_filesums: bool) -> anyhow::Result<()> {
    let cfg = scan_config(sb);
    let (graph, nodes) = scan_into_graph(devices, sb, &cfg);
    let source = MapNodeSource(nodes);
    let forest = build_forest(&graph, sb, &source)?;
    let volume = bootstrap_volume(devices, sb, cli.mappings.as_ref())?;
    btrfs_rebuild::mount::mount_readonly(&forest, &volume, cfg.sector_size, cfg.checksum_kind, mountpoint, skip_filesums)
}

#[cfg(not(feature = "mount"))]
fn cmd_mount(_cli: &Cli, _devices: &DeviceSet, _sb: &SuperBlock, _mountpoint: &PathBuf, _skip_filesums: bool) -> anyhow::Result<()> {
    anyhow::bail!("mount support was not built; rebuild with --features mount")
}
