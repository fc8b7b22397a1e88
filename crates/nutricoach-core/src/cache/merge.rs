/// What an optimistic list merge did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// An entry with the same logical key was replaced at this index
    Replaced(usize),
    /// No match; the item was prepended
    Prepended,
}

/// Merge `item` into a cached list.
///
/// An entry sharing the item's logical key is replaced in place (later value
/// wins) and any further duplicates are dropped. Otherwise the item is
/// prepended and the list truncated to `page_size` (0 means unbounded).
pub fn merge_into_list<T, K, F>(
    list: &mut Vec<T>,
    item: T,
    logical_key: F,
    page_size: usize,
) -> MergeOutcome
where
    F: Fn(&T) -> K,
    K: PartialEq,
{
    let key = logical_key(&item);
    match list.iter().position(|existing| logical_key(existing) == key) {
        Some(index) => {
            list[index] = item;
            let mut seen = 0;
            list.retain(|existing| {
                if logical_key(existing) != key {
                    return true;
                }
                seen += 1;
                seen == 1
            });
            MergeOutcome::Replaced(index)
        }
        None => {
            list.insert(0, item);
            if page_size > 0 {
                list.truncate(page_size);
            }
            MergeOutcome::Prepended
        }
    }
}
