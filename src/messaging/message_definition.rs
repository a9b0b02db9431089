use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use anyhow::bail;
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::messaging::message::Message;
use crate::messaging::net_address::NetAddress;
use crate::messaging::ConnectionIndex;

/// The number of ordering channels per connection. Channel ids are `0..MAX_CHANNELS`.
pub const MAX_CHANNELS: usize = 8;

/// Definition ids are sent as a single byte
pub const MAX_DEFINITIONS: usize = 256;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
    pub struct DefinitionFlags: u8 {
        const RELIABLE       = 0b0000_0001;
        const IN_ORDER       = 0b0000_0010;
        const CONNECTIONLESS = 0b0000_0100;
    }
}

/// Delivery options of a message definition.
///
/// NB: in-order delivery implies reliable delivery - an unreliable message on an ordering
///      channel would stall the channel forever once it got lost
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub struct MessageOptions {
    flags: DefinitionFlags,
    channel: u8,
}

impl MessageOptions {
    pub fn unreliable() -> MessageOptions {
        MessageOptions::default()
    }

    pub fn reliable() -> MessageOptions {
        MessageOptions {
            flags: DefinitionFlags::RELIABLE,
            channel: 0,
        }
    }

    pub fn in_order(channel: u8) -> MessageOptions {
        MessageOptions {
            flags: DefinitionFlags::RELIABLE | DefinitionFlags::IN_ORDER,
            channel,
        }
    }

    /// may be sent to and received from addresses without an established connection
    pub fn connectionless() -> MessageOptions {
        MessageOptions {
            flags: DefinitionFlags::CONNECTIONLESS,
            channel: 0,
        }
    }

    pub fn flags(&self) -> DefinitionFlags {
        self.flags
    }

    fn validate(&self, name: &str) -> anyhow::Result<()> {
        if self.flags.contains(DefinitionFlags::CONNECTIONLESS) && self.flags.intersects(DefinitionFlags::RELIABLE | DefinitionFlags::IN_ORDER) {
            bail!("message {:?}: connectionless messages can not be reliable or ordered", name);
        }
        if self.flags.contains(DefinitionFlags::IN_ORDER) && self.channel as usize >= MAX_CHANNELS {
            bail!("message {:?}: channel {} exceeds the maximum of {} channels", name, self.channel, MAX_CHANNELS);
        }
        Ok(())
    }
}


/// Where a received message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    pub address: NetAddress,
    pub binding: usize,
    /// `None` for connectionless messages from peers without a connection
    pub connection: Option<ConnectionIndex>,
}

/// Application callback for received messages of a given definition. It is called exactly once
///  per decoded, non-duplicate message, and for ordered messages only after all preceding
///  messages on the same channel.
///
/// This is a blocking call inside the session's receive processing. Non-trivial work should be
///  queued by the handler and done outside the tick.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: &Message, sender: &SenderInfo);
}

impl<F> MessageHandler for F
where F: Fn(&Message, &SenderInfo) + Send + Sync + 'static
{
    fn on_message(&self, message: &Message, sender: &SenderInfo) {
        self(message, sender)
    }
}


pub struct MessageDefinition {
    id: u8,
    name: String,
    options: MessageOptions,
    handler: Arc<dyn MessageHandler>,
}

impl Debug for MessageDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageDefinition{{{}:{:?}:{:?}}}", self.id, self.name, self.options)
    }
}

impl MessageDefinition {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> DefinitionFlags {
        self.options.flags
    }

    pub fn is_reliable(&self) -> bool {
        self.options.flags.contains(DefinitionFlags::RELIABLE)
    }

    pub fn is_connectionless(&self) -> bool {
        self.options.flags.contains(DefinitionFlags::CONNECTIONLESS)
    }

    /// the ordering channel for in-order messages
    pub fn channel(&self) -> Option<u8> {
        if self.options.flags.contains(DefinitionFlags::IN_ORDER) {
            Some(self.options.channel)
        }
        else {
            None
        }
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    #[cfg(test)]
    pub fn for_test(id: u8, name: &str, options: MessageOptions) -> Arc<MessageDefinition> {
        Arc::new(MessageDefinition {
            id,
            name: name.to_string(),
            options,
            handler: Arc::new(|_: &Message, _: &SenderInfo| {}),
        })
    }
}


/// Holds all message definitions of a session. Definitions are registered up front, and
///  [MessageRegistry::finalize] then assigns ids by sorting names. Both peers must register the
///  same set of names (with the same options) to agree on ids, there is no negotiation.
#[derive(Default)]
pub struct MessageRegistry {
    pending: Vec<(String, MessageOptions, Arc<dyn MessageHandler>)>,
    definitions: Vec<Arc<MessageDefinition>>,
    by_name: FxHashMap<String, Arc<MessageDefinition>>,
    finalized: bool,
}

impl MessageRegistry {
    pub fn register(&mut self, name: &str, options: MessageOptions, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        if self.finalized {
            bail!("message {:?} registered after definitions were finalized", name);
        }
        if name.is_empty() {
            bail!("message names must not be empty");
        }
        options.validate(name)?;
        if self.pending.iter().any(|(n, _, _)| n == name) {
            bail!("message {:?} is registered twice", name);
        }
        if self.pending.len() == MAX_DEFINITIONS {
            bail!("more than {} message definitions", MAX_DEFINITIONS);
        }

        self.pending.push((name.to_string(), options, handler));
        Ok(())
    }

    pub fn finalize(&mut self) -> anyhow::Result<()> {
        if self.finalized {
            bail!("message definitions are already finalized");
        }

        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, (name, options, handler)) in pending.into_iter().enumerate() {
            let definition = Arc::new(MessageDefinition {
                id: id.try_into()?,
                name,
                options,
                handler,
            });
            debug!("message definition {:?}", definition);
            self.by_name.insert(definition.name.clone(), definition.clone());
            self.definitions.push(definition);
        }

        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn len(&self) -> usize {
        if self.finalized { self.definitions.len() } else { self.pending.len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: u8) -> Option<&Arc<MessageDefinition>> {
        self.definitions.get(id as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<MessageDefinition>> {
        self.by_name.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn noop() -> Arc<dyn MessageHandler> {
        Arc::new(MockMessageHandler::new())
    }

    #[test]
    fn test_ids_sorted_by_name() {
        let mut a = MessageRegistry::default();
        a.register("spam", MessageOptions::unreliable(), noop()).unwrap();
        a.register("ping", MessageOptions::in_order(0), noop()).unwrap();
        a.register("chat", MessageOptions::reliable(), noop()).unwrap();
        a.finalize().unwrap();

        let mut b = MessageRegistry::default();
        b.register("chat", MessageOptions::reliable(), noop()).unwrap();
        b.register("ping", MessageOptions::in_order(0), noop()).unwrap();
        b.register("spam", MessageOptions::unreliable(), noop()).unwrap();
        b.finalize().unwrap();

        for (name, id) in [("chat", 0), ("ping", 1), ("spam", 2)] {
            assert_eq!(a.by_name(name).unwrap().id(), id);
            assert_eq!(b.by_name(name).unwrap().id(), id);
            assert_eq!(a.get(id).unwrap().name(), name);
        }
        assert!(a.get(3).is_none());
    }

    #[test]
    fn test_register_after_finalize() {
        let mut registry = MessageRegistry::default();
        registry.finalize().unwrap();
        assert!(registry.register("late", MessageOptions::unreliable(), noop()).is_err());
        assert!(registry.finalize().is_err());
    }

    #[rstest]
    #[case::duplicate("a", MessageOptions::unreliable(), false)]
    #[case::empty_name("", MessageOptions::unreliable(), false)]
    #[case::channel_out_of_range("b", MessageOptions::in_order(MAX_CHANNELS as u8), false)]
    #[case::max_channel("b", MessageOptions::in_order(MAX_CHANNELS as u8 - 1), true)]
    #[case::regular("b", MessageOptions::reliable(), true)]
    fn test_register_validation(#[case] name: &str, #[case] options: MessageOptions, #[case] expected_ok: bool) {
        let mut registry = MessageRegistry::default();
        registry.register("a", MessageOptions::unreliable(), noop()).unwrap();
        assert_eq!(registry.register(name, options, noop()).is_ok(), expected_ok);
    }

    #[test]
    fn test_connectionless_reliable_is_rejected() {
        let options = MessageOptions {
            flags: DefinitionFlags::CONNECTIONLESS | DefinitionFlags::RELIABLE,
            channel: 0,
        };
        let mut registry = MessageRegistry::default();
        assert!(registry.register("x", options, noop()).is_err());
    }

    #[test]
    fn test_flags() {
        let ordered = MessageDefinition::for_test(0, "o", MessageOptions::in_order(3));
        assert!(ordered.is_reliable());
        assert_eq!(ordered.channel(), Some(3));
        assert!(!ordered.is_connectionless());

        let unreliable = MessageDefinition::for_test(1, "u", MessageOptions::unreliable());
        assert!(!unreliable.is_reliable());
        assert_eq!(unreliable.channel(), None);

        let connectionless = MessageDefinition::for_test(2, "c", MessageOptions::connectionless());
        assert!(connectionless.is_connectionless());
    }
}
