//! Registry of descriptors with key-based dispatch.

use rustc_hash::FxHashMap;

use crate::descriptor::KVDescriptor;

/// Holds registered descriptors and dispatches keys to them.
///
/// Registration order defines key-selector priority: the first registered
/// descriptor whose selector matches a key owns it. Callers must keep
/// selectors disjoint; the linear scan then behaves like a partition.
#[derive(Default)]
pub struct DescriptorRegistry {
    order: Vec<String>,
    descriptors: FxHashMap<String, KVDescriptor>,
}

impl DescriptorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor. Replaces a previous descriptor of the same
    /// name while keeping its priority slot.
    pub fn register(&mut self, descriptor: KVDescriptor) {
        let name = descriptor.name.clone();
        if !self.descriptors.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.descriptors.insert(name, descriptor);
    }

    /// Looks a descriptor up by name.
    pub fn get(&self, name: &str) -> Option<&KVDescriptor> {
        self.descriptors.get(name)
    }

    /// Finds the descriptor owning the given key, if any.
    pub fn descriptor_for_key(&self, key: &str) -> Option<&KVDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.descriptors.get(name))
            .find(|descriptor| (descriptor.key_selector)(key))
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &KVDescriptor> {
        self.order
            .iter()
            .filter_map(move |name| self.descriptors.get(name))
    }

    /// Descriptor names ordered so that every descriptor follows all of its
    /// dump dependencies. Unknown dependency names are ignored.
    pub fn dump_order(&self) -> Vec<String> {
        let mut ordered = Vec::with_capacity(self.order.len());
        let mut visited = FxHashMap::default();
        for name in &self.order {
            self.visit_dump_order(name, &mut visited, &mut ordered);
        }
        ordered
    }

    fn visit_dump_order(
        &self,
        name: &str,
        visited: &mut FxHashMap<String, bool>,
        ordered: &mut Vec<String>,
    ) {
        match visited.get(name) {
            Some(_) => return, // done or on the current path (cycle)
            None => {}
        }
        visited.insert(name.to_string(), false);
        if let Some(descriptor) = self.descriptors.get(name) {
            for dep in &descriptor.dump_dependencies {
                if self.descriptors.contains_key(dep) {
                    self.visit_dump_order(dep, visited, ordered);
                }
            }
            ordered.push(name.to_string());
        }
        visited.insert(name.to_string(), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TypedKVDescriptor;

    fn named(name: &str, prefix: &'static str, dump_deps: Vec<String>) -> KVDescriptor {
        TypedKVDescriptor::<u32>::new(name, move |key| key.starts_with(prefix))
            .dump_dependencies(dump_deps)
            .build()
    }

    #[test]
    fn first_matching_selector_wins() {
        let mut registry = DescriptorRegistry::new();
        registry.register(named("narrow", "a/b/", vec![]));
        registry.register(named("wide", "a/", vec![]));

        assert_eq!(registry.descriptor_for_key("a/b/c").unwrap().name, "narrow");
        assert_eq!(registry.descriptor_for_key("a/x").unwrap().name, "wide");
        assert!(registry.descriptor_for_key("z/x").is_none());
    }

    #[test]
    fn dump_order_respects_dependencies() {
        let mut registry = DescriptorRegistry::new();
        registry.register(named("routes", "route/", vec!["interfaces".to_string()]));
        registry.register(named("interfaces", "if/", vec![]));

        let order = registry.dump_order();
        let routes = order.iter().position(|n| n == "routes").unwrap();
        let interfaces = order.iter().position(|n| n == "interfaces").unwrap();
        assert!(interfaces < routes);
    }
}
