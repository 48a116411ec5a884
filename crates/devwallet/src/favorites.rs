//! Favorite operators, scoped by module and chain so ids from different registries never
//! collide.

use crate::types::ModuleType;
use alloy_primitives::ChainId;

/// Builds the scoped favorite key `<module>:<chainId>:<operatorId>`.
pub fn fav_key(module_type: ModuleType, chain_id: ChainId, operator_id: &str) -> String {
    format!("{module_type}:{chain_id}:{}", operator_id.trim())
}

/// Returns true if the key already carries a module and chain scope.
pub fn is_scoped(key: &str) -> bool {
    key.contains(':')
}

/// Adds the favorite if absent, removes it if present. Order of the remaining keys is kept.
pub fn toggle_favorite(
    favorites: &[String],
    module_type: ModuleType,
    chain_id: ChainId,
    operator_id: &str,
) -> Vec<String> {
    let key = fav_key(module_type, chain_id, operator_id);
    if favorites.contains(&key) {
        favorites.iter().filter(|fav| **fav != key).cloned().collect()
    } else {
        let mut next = favorites.to_vec();
        next.push(key);
        next
    }
}

/// Operator ids favorited under the given scope.
pub fn active_favorites<'a>(
    favorites: &'a [String],
    module_type: ModuleType,
    chain_id: ChainId,
) -> impl Iterator<Item = &'a str> + 'a {
    let prefix = format!("{module_type}:{chain_id}:");
    favorites.iter().filter_map(move |fav| fav.strip_prefix(prefix.as_str()))
}
