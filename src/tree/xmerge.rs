//! Eviction-time subtree merge.
//!
//! Invoked by the buffer pool when it is about to evict: instead of losing
//! a hot page, try to empty one cold child of a random resident inner node
//! by compacting a contiguous window of its siblings, then hand the emptied
//! child's slot to the page that triggered the reclaim. Runs entirely under
//! the pool's exclusive table lock on unpinned pages, so no descent can
//! observe the intermediate states.

use rand::Rng;
use tracing::debug;

use crate::buffer::{PageWriteGuard, ReclaimScope};
use crate::error::Result;
use crate::store::BlockId;
use crate::tree::node::Node;

/// Upper bound on the number of children compacted in one merge.
const MAX_WINDOW: usize = 6;

/// Tries to satisfy the pending load of `target` by merging. Returns true
/// only after a fully completed merge has made `target` resident.
pub(crate) fn attempt(
    scope: &mut ReclaimScope<'_>,
    target: BlockId,
    capacity: usize,
) -> Result<bool> {
    if scope.inner_nodes().is_empty() {
        return Ok(false);
    }
    debug_assert!(scope.resident(target).is_none());
    let mut rng = rand::thread_rng();

    let pick = rng.gen_range(0..scope.inner_nodes().len());
    let Some(&parent_id) = scope.inner_nodes().iter().nth(pick) else {
        return Ok(false);
    };
    let Some(parent_page) = scope.resident(parent_id).cloned() else {
        return Ok(false);
    };
    if parent_page.is_deleted() || parent_page.pin_count() > 0 {
        return Ok(false);
    }
    // unpinned plus the held table lock means these never block; bail rather
    // than wait if that assumption is ever violated
    let Some(mut parent_guard) = parent_page.buf.try_write_arc() else {
        return Ok(false);
    };
    let mut parent = Node::decode(&parent_guard, capacity)?;
    if parent.leaf || parent.keys.len() <= 1 {
        return Ok(false);
    }

    let child_count = parent.keys.len() + 1;
    let origin = rng.gen_range(0..=parent.keys.len().saturating_sub(MAX_WINDOW));
    let upper = child_count.min(origin + MAX_WINDOW);
    let mut window_start = origin;
    let mut pages = Vec::new();
    let mut guards: Vec<PageWriteGuard> = Vec::new();
    let mut nodes: Vec<Node> = Vec::new();
    let mut free_slots = 0;

    for i in origin..upper {
        let child_id = parent.children[i];
        let candidate = scope
            .resident(child_id)
            .filter(|page| !page.is_deleted() && page.pin_count() == 0)
            .cloned()
            .and_then(|page| page.buf.try_write_arc().map(|guard| (page, guard)));
        let Some((child_page, child_guard)) = candidate else {
            // unusable child: restart the window behind it
            window_start = i + 1;
            free_slots = 0;
            pages.clear();
            guards.clear();
            nodes.clear();
            continue;
        };
        let child = Node::decode(&child_guard, capacity)?;
        debug_assert_eq!(child.leaf, nodes.first().map_or(child.leaf, |n: &Node| n.leaf));
        free_slots += (capacity - 1).saturating_sub(child.keys.len());
        pages.push(child_page);
        guards.push(child_guard);
        nodes.push(child);

        // leaf windows must absorb every key of the window; inner windows
        // additionally pay one separator through the parent
        let needed = if nodes[0].leaf { capacity } else { capacity + 1 };
        if free_slots < needed {
            continue;
        }

        let page_ids: Vec<BlockId> = pages.iter().map(|page| page.id).collect();
        redistribute(&mut parent, window_start, &mut nodes, &page_ids);
        for ((node, guard), page) in nodes.iter().zip(guards.iter_mut()).zip(pages.iter()).skip(1)
        {
            node.encode(guard, capacity);
            page.set_modified(true);
        }
        parent.encode(&mut parent_guard, capacity);
        parent_page.set_modified(true);
        drop(guards);
        drop(parent_guard);

        let victim = page_ids[0];
        scope.adopt_slot(victim, target)?;
        debug!(parent = parent_id, victim, adopted = target, "tree.xmerge");
        return Ok(true);
    }
    Ok(false)
}

/// Compacts the window `parent.children[start ..= start + nodes.len() - 1]`
/// so its leftmost member ends empty, then removes that member's separator
/// and pointer from the parent.
///
/// Leaf windows re-chunk the flattened (key, record) pairs evenly across
/// the kept children and refresh the parent separators from each kept
/// child's first key. Inner windows flatten child keys, the parent
/// separators between them, and all child pointers into one alternating
/// sequence, re-chunk it, and thread one refreshed separator back into the
/// parent between each kept pair.
fn redistribute(parent: &mut Node, start: usize, nodes: &mut [Node], page_ids: &[BlockId]) {
    let m = nodes.len();
    debug_assert!(m >= 2, "a single child can never absorb itself");
    let kept = m - 1;

    if nodes[0].leaf {
        let mut keys = Vec::new();
        let mut records = Vec::new();
        for node in nodes.iter() {
            keys.extend_from_slice(&node.keys);
            records.extend_from_slice(&node.children[..node.keys.len()]);
        }
        // the rightmost kept child keeps its old outbound sibling link
        let tail_link = *nodes[m - 1]
            .children
            .last()
            .unwrap_or(&0);
        let sizes = chunk_sizes(keys.len(), kept);
        let mut offset = 0;
        for j in 0..kept {
            let take = sizes[j];
            let node = &mut nodes[j + 1];
            node.keys = keys[offset..offset + take].to_vec();
            node.children = records[offset..offset + take].to_vec();
            let sibling = if j + 1 < kept {
                page_ids[j + 2]
            } else {
                tail_link
            };
            node.children.push(sibling);
            offset += take;
            // refresh the separator guarding this child's new lower bound
            if j > 0 {
                if let Some(&first) = nodes[j + 1].keys.first() {
                    parent.keys[start + j] = first;
                }
            }
        }
    } else {
        let mut keys = Vec::new();
        let mut pointers = Vec::new();
        for (j, node) in nodes.iter().enumerate() {
            if j > 0 {
                keys.push(parent.keys[start + j - 1]);
            }
            keys.extend_from_slice(&node.keys);
            pointers.extend_from_slice(&node.children);
        }
        // kept children share all keys except the kept-1 refreshed separators
        let sizes = chunk_sizes(keys.len() - (kept - 1), kept);
        let mut kpos = 0;
        let mut ppos = 0;
        for j in 0..kept {
            let take = sizes[j];
            let node = &mut nodes[j + 1];
            node.keys = keys[kpos..kpos + take].to_vec();
            kpos += take;
            node.children = pointers[ppos..ppos + take + 1].to_vec();
            ppos += take + 1;
            if j + 1 < kept {
                parent.keys[start + j + 1] = keys[kpos];
                kpos += 1;
            }
        }
        debug_assert_eq!(kpos, keys.len());
        debug_assert_eq!(ppos, pointers.len());
    }

    parent.keys.remove(start);
    parent.children.remove(start);
}

/// Splits `total` into `parts` chunks differing by at most one, larger
/// chunks to the right.
fn chunk_sizes(total: usize, parts: usize) -> Vec<usize> {
    let base = total / parts;
    let extra = total % parts;
    (0..parts)
        .map(|j| base + usize::from(j >= parts - extra))
        .collect()
}
