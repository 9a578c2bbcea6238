//! A binary prefix trie over IP networks, supporting longest-prefix matching.

use ipnet::IpNet;
use std::net::IpAddr;

#[derive(Debug)]
pub struct IpTrie<V> {
    v4: Node<V>,
    v6: Node<V>,
    len: usize,
}

#[derive(Debug)]
struct Node<V> {
    value: Option<V>,
    children: [Option<Box<Node<V>>>; 2],
}

/// An address or network, left-aligned into 128 bits.
#[derive(Copy, Clone, Debug)]
struct Bits {
    bits: u128,
    len: u8,
}

// === impl IpTrie ===

impl<V> Default for IpTrie<V> {
    fn default() -> Self {
        Self {
            v4: Node::default(),
            v6: Node::default(),
            len: 0,
        }
    }
}

impl<V> IpTrie<V> {
    /// Stores a value for a network, returning the value it replaces.
    pub fn insert(&mut self, net: IpNet, value: V) -> Option<V> {
        let key = Bits::from_net(&net);
        let mut node = self.root_mut(&net);
        for i in 0..key.len {
            node = node.children[key.bit(i)]
                .get_or_insert_with(Default::default)
                .as_mut();
        }
        let old = node.value.replace(value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    pub fn remove(&mut self, net: &IpNet) -> Option<V> {
        let key = Bits::from_net(net);
        let removed = self.root_mut(net).remove(key, 0);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Returns the value stored for exactly this network.
    pub fn get(&self, net: &IpNet) -> Option<&V> {
        let key = Bits::from_net(net);
        let mut node = self.root(net);
        for i in 0..key.len {
            node = node.children[key.bit(i)].as_deref()?;
        }
        node.value.as_ref()
    }

    pub fn get_mut(&mut self, net: &IpNet) -> Option<&mut V> {
        let key = Bits::from_net(net);
        let mut node = self.root_mut(net);
        for i in 0..key.len {
            node = node.children[key.bit(i)].as_deref_mut()?;
        }
        node.value.as_mut()
    }

    /// Finds the most specific network containing the address.
    pub fn longest_match(&self, addr: IpAddr) -> Option<(IpNet, &V)> {
        let key = Bits::from_addr(addr);
        let mut node = match addr {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };

        let mut best = node.value.as_ref().map(|v| (0, v));
        for i in 0..key.len {
            match node.children[key.bit(i)].as_deref() {
                Some(child) => node = child,
                None => break,
            }
            if let Some(v) = node.value.as_ref() {
                best = Some((i + 1, v));
            }
        }

        let (prefix, value) = best?;
        let net = IpNet::new(addr, prefix).ok()?.trunc();
        Some((net, value))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn root(&self, net: &IpNet) -> &Node<V> {
        match net {
            IpNet::V4(_) => &self.v4,
            IpNet::V6(_) => &self.v6,
        }
    }

    fn root_mut(&mut self, net: &IpNet) -> &mut Node<V> {
        match net {
            IpNet::V4(_) => &mut self.v4,
            IpNet::V6(_) => &mut self.v6,
        }
    }
}

// === impl Node ===

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: [None, None],
        }
    }
}

impl<V> Node<V> {
    fn remove(&mut self, key: Bits, depth: u8) -> Option<V> {
        if depth == key.len {
            return self.value.take();
        }

        let bit = key.bit(depth);
        let child = self.children[bit].as_deref_mut()?;
        let removed = child.remove(key, depth + 1);
        if child.is_empty() {
            self.children[bit] = None;
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.iter().all(Option::is_none)
    }
}

// === impl Bits ===

impl Bits {
    fn from_net(net: &IpNet) -> Self {
        let net = net.trunc();
        Self {
            len: net.prefix_len(),
            ..Self::from_addr(net.network())
        }
    }

    fn from_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => Self {
                bits: u128::from(u32::from(a)) << 96,
                len: 32,
            },
            IpAddr::V6(a) => Self {
                bits: u128::from(a),
                len: 128,
            },
        }
    }

    fn bit(&self, i: u8) -> usize {
        ((self.bits >> (127 - u32::from(i))) & 1) as usize
    }
}
