use btrfs_rebuild::addr::{Generation, Key, LogicalAddr, ObjID};
use btrfs_rebuild::forest::{Forest, MapNodeSource, SystemRoots};
use btrfs_rebuild::graph::Graph;
use btrfs_rebuild::items::ItemBody;
use btrfs_rebuild::node::{LeafItem, Node, NodeBody};
use btrfs_rebuild::structures::{
    DevItem, DiskKey, InodeItem, RootItem, SuperBlock, Timespec, BTRFS_CSUM_SIZE, BTRFS_FSID_SIZE,
    BTRFS_LABEL_SIZE, BTRFS_NUM_BACKUP_ROOTS, BTRFS_SYSTEM_CHUNK_ARRAY_SIZE,
};

fn zero_dev_item() -> DevItem {
    DevItem {
        devid: 1,
        total_bytes: 0,
        bytes_used: 0,
        io_align: 4096,
        io_width: 4096,
        sector_size: 4096,
        dev_type: 0,
        generation: 0,
        start_offset: 0,
        dev_group: 0,
        seek_speed: 0,
        bandwidth: 0,
        uuid: [0u8; 16],
        fsid: [0u8; BTRFS_FSID_SIZE],
    }
}

/// A superblock with every field zeroed except the root-tree pointer this
/// test actually exercises.
fn root_tree_superblock(root: u64, root_level: u8, generation: u64) -> SuperBlock {
    SuperBlock {
        csum: [0u8; BTRFS_CSUM_SIZE],
        fsid: [0u8; BTRFS_FSID_SIZE],
        bytenr: 0,
        flags: 0,
        magic: 0,
        generation,
        root,
        chunk_root: 0,
        log_root: 0,
        total_bytes: 0,
        bytes_used: 0,
        root_dir_objectid: 256,
        num_devices: 1,
        sectorsize: 4096,
        nodesize: 16384,
        stripesize: 4096,
        sys_chunk_array_size: 0,
        chunk_root_generation: 0,
        compat_flags: 0,
        compat_ro_flags: 0,
        incompat_flags: 0,
        csum_type: 0,
        root_level,
        chunk_root_level: 0,
        log_root_level: 0,
        dev_item: zero_dev_item(),
        label: [0u8; BTRFS_LABEL_SIZE],
        cache_generation: 0,
        uuid_tree_generation: 0,
        metadata_uuid: [0u8; BTRFS_FSID_SIZE],
        nr_global_roots: 0,
        sys_chunk_array: [0u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
        super_roots: [Default::default(); BTRFS_NUM_BACKUP_ROOTS],
    }
}

fn zero_timespec() -> Timespec {
    Timespec { sec: 0, nsec: 0 }
}

fn inode_item(size: u64) -> InodeItem {
    InodeItem {
        generation: 1,
        transid: 1,
        size,
        nbytes: size,
        block_group: 0,
        nlink: 1,
        uid: 0,
        gid: 0,
        mode: 0o100644,
        rdev: 0,
        flags: 0,
        sequence: 0,
        atime: zero_timespec(),
        ctime: zero_timespec(),
        mtime: zero_timespec(),
        otime: zero_timespec(),
    }
}

fn root_item(bytenr: u64, level: u8, generation: u64) -> RootItem {
    RootItem {
        inode: inode_item(0),
        generation,
        root_dirid: 256,
        bytenr,
        byte_limit: 0,
        bytes_used: 0,
        last_snapshot: 0,
        flags: 0,
        refs: 1,
        drop_progress: DiskKey { objectid: 0, item_type: 0, offset: 0 },
        drop_level: 0,
        level,
        generation_v2: generation,
        uuid: [0u8; 16],
        parent_uuid: [0u8; 16],
        received_uuid: [0u8; 16],
        ctransid: 0,
        otransid: 0,
        stransid: 0,
        rtransid: 0,
    }
}

fn leaf(addr: i64, owner: ObjID, generation: u64, items: Vec<LeafItem>) -> Node {
    Node {
        addr: LogicalAddr::new(addr),
        generation: Generation::new(generation as i64),
        owner,
        level: 0,
        flags: 0,
        body: NodeBody::Leaf(items),
    }
}

/// Builds the graph for a filesystem with exactly one subvolume: a single
/// root-tree leaf holding FS_TREE's `ROOT_ITEM`, pointing at FS_TREE's own
/// single-leaf tree holding one inode.
fn single_subvolume_graph() -> (Graph, SuperBlock, std::collections::HashMap<LogicalAddr, std::sync::Arc<Node>>) {
    const ROOT_ITEM_TYPE: u8 = 0x84;
    const INODE_ITEM_TYPE: u8 = 0x01;

    let root_item_key = Key::new(ObjID::FS_TREE, ROOT_ITEM_TYPE, 0);
    let root_tree_leaf = leaf(
        0x1000,
        ObjID::ROOT_TREE,
        2,
        vec![LeafItem {
            key: root_item_key,
            body: ItemBody::Root(root_item(0x2000, 0, 5)),
        }],
    );
    let inode_key = Key::new(ObjID::from(256i64), INODE_ITEM_TYPE, 0);
    let fs_tree_leaf = leaf(
        0x2000,
        ObjID::FS_TREE,
        5,
        vec![LeafItem {
            key: inode_key,
            body: ItemBody::Inode(inode_item(8192)),
        }],
    );

    let mut graph = Graph::new();
    let sb = root_tree_superblock(0x1000, 0, 2);
    graph.seed_from_superblock(&sb);
    graph.insert_node(&root_tree_leaf);
    graph.insert_node(&fs_tree_leaf);

    let mut nodes = std::collections::HashMap::new();
    nodes.insert(root_tree_leaf.addr, std::sync::Arc::new(root_tree_leaf));
    nodes.insert(fs_tree_leaf.addr, std::sync::Arc::new(fs_tree_leaf));

    (graph, sb, nodes)
}

#[test]
fn fs_tree_resolves_through_root_item_and_lists_its_inode() {
    let (graph, sb, nodes) = single_subvolume_graph();
    let system_roots = SystemRoots::from_superblock(&sb);
    let source = MapNodeSource(nodes);
    let forest = Forest::new(&graph, system_roots, &source);

    let fs_tree = forest.tree(ObjID::FS_TREE).expect("fs tree resolves via the root tree's ROOT_ITEM");

    let mut seen = Vec::new();
    forest.tree_range(&fs_tree, |key, item| seen.push((key, item)));
    assert_eq!(seen.len(), 1);
    match &seen[0].1.body {
        ItemBody::Inode(i) => assert_eq!(i.size, 8192),
        other => panic!("unexpected item body: {:?}", std::mem::discriminant(other)),
    }
}

#[test]
fn subvolume_items_are_not_visible_through_the_root_tree() {
    let (graph, sb, nodes) = single_subvolume_graph();
    let system_roots = SystemRoots::from_superblock(&sb);
    let source = MapNodeSource(nodes);
    let forest = Forest::new(&graph, system_roots, &source);

    // Force both trees to resolve.
    let _ = forest.tree(ObjID::FS_TREE).unwrap();
    let root_tree = forest.tree(ObjID::ROOT_TREE).unwrap();

    let mut seen = Vec::new();
    forest.tree_range(&root_tree, |key, item| seen.push((key, item)));
    // Only the ROOT_ITEM itself belongs to the root tree; the inode item
    // living in the fs tree's own leaf must not leak in alongside it.
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.item_type, 0x84);
}

#[test]
fn leaf_to_roots_resolves_subvolume_root_to_itself() {
    let (graph, sb, nodes) = single_subvolume_graph();
    let system_roots = SystemRoots::from_superblock(&sb);
    let source = MapNodeSource(nodes);
    let forest = Forest::new(&graph, system_roots, &source);

    let roots = forest.leaf_to_roots(LogicalAddr::new(0x2000));
    assert_eq!(roots.len(), 1);
    assert!(roots.contains(&LogicalAddr::new(0x2000)));
}
