//! Blockwise transfer of large bodies.
//!
//! Bodies longer than the configured block size leave the stack one block at
//! a time, and bodies a peer sends in blocks are reassembled before they go
//! further up. Four roles meet here:
//!
//! - A request body we send goes out as Block1 blocks, each sent once the
//!   peer answered the previous one with 2.31 Continue.
//! - A request body a peer sends is collected block by block, each block
//!   answered with 2.31 Continue, until the last one completes the request.
//! - A response body we send goes out as Block2 block 0, and the peer asks
//!   for every further block with a request naming it.
//! - A response body a peer sends is collected by asking for each further
//!   block with a copy of the original request.
//!
//! Transfers are identified by peer and token. Blocks must arrive in order.
//! An early block makes us ask again for the expected one, at most
//! `max_block_retries` times per transfer, after which the transfer is
//! abandoned. So is a transfer whose block size changes midway.

use crate::{
    config::StackConfig,
    layer::{Cancellation, Context, Failure, FailureReason, Layer, ReceiveError, SendError},
    message::{Code, Message, OptionNumber, Payload, Token},
    timer::every,
    FxDashMap, Shutdown,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::Instant;

mod block;
pub use block::{Block, BlockError, MAX_SZX};

type Key = (SocketAddr, Token);

pub struct TransferLayer {
    /// The size exponent for outbound bodies, if they are split at all.
    szx: Option<u8>,
    max_retries: u32,
    lifetime: Duration,
    /// Requests we sent, to ask for further blocks of their responses.
    templates: FxDashMap<Key, Template>,
    /// Request bodies we send block by block.
    uploads: FxDashMap<Key, Upload>,
    /// Response bodies we receive block by block.
    downloads: FxDashMap<Key, Reassembly>,
    /// Request bodies we receive block by block.
    assemblies: FxDashMap<Key, Reassembly>,
    /// Response bodies we serve block by block.
    served: FxDashMap<Key, Served>,
    /// The last Block1 of a reassembled request, echoed in its response.
    echoes: FxDashMap<Key, (Block, Instant)>,
}

struct Template {
    request: Message,
    created: Instant,
}

struct Upload {
    request: Message,
    szx: u8,
    /// The number of the block sent last.
    sent: u32,
    retries: u32,
    created: Instant,
}

struct Served {
    response: Message,
    szx: u8,
    created: Instant,
}

/// A body being collected from blocks.
struct Reassembly {
    buffer: Payload,
    next: u32,
    szx: u8,
    retries: u32,
    created: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Accepted { more: bool },
    Duplicate,
    OutOfOrder { expected: u32, give_up: bool },
    SizeChanged,
    Unknown,
}

impl Reassembly {
    fn new(szx: u8) -> Self {
        Self {
            buffer: Payload::empty(),
            next: 0,
            szx,
            retries: 0,
            created: Instant::now(),
        }
    }

    fn offer(&mut self, block: Block, payload: &Payload, max_retries: u32) -> Progress {
        if block.szx != self.szx {
            return Progress::SizeChanged;
        }
        if block.num == self.next {
            self.buffer.concatenate(payload.clone());
            self.next += 1;
            Progress::Accepted { more: block.more }
        } else if block.num < self.next {
            Progress::Duplicate
        } else {
            self.retries += 1;
            Progress::OutOfOrder {
                expected: self.next,
                give_up: self.retries > max_retries,
            }
        }
    }
}

/// The part of `message`'s body that block `num` covers, as a copy of
/// `message` with the block option `number` set. The first block also
/// announces the size of the whole body.
fn cut(message: &Message, number: OptionNumber, num: u32, szx: u8) -> Option<Message> {
    let len = message.payload.len();
    let start = Block::new(num, false, szx).offset();
    if num > 0 && start >= len {
        return None;
    }
    let end = (start + Block::size_of(szx)).min(len);
    let mut part = message.clone();
    part.payload = message.payload.slice(start..end);
    Block::new(num, end < len, szx).write(&mut part.options, number);
    if num == 0 {
        let size = if number == OptionNumber::BLOCK1 {
            OptionNumber::SIZE1
        } else {
            OptionNumber::SIZE2
        };
        part.options.set_uint(size, len as u32);
    }
    Some(part)
}

/// Removes the blockwise bookkeeping from a reassembled message.
fn strip(message: &mut Message, block: OptionNumber, size: OptionNumber) {
    message.options.remove(block);
    message.options.remove(size);
}

impl TransferLayer {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            szx: Block::szx_for(config.block_size),
            max_retries: config.max_block_retries,
            lifetime: config.exchange_lifetime,
            templates: Default::default(),
            uploads: Default::default(),
            downloads: Default::default(),
            assemblies: Default::default(),
            served: Default::default(),
            echoes: Default::default(),
        }
    }

    /// The size exponent to split `payload` with, if it needs splitting.
    fn split(&self, payload: &Payload) -> Option<u8> {
        self.szx
            .filter(|szx| payload.len() > Block::size_of(*szx))
    }

    fn forget(&self, key: &Key) {
        self.templates.remove(key);
        self.uploads.remove(key);
        self.downloads.remove(key);
    }

    /// Gives up on a transfer we take part in as a client.
    fn abort(&self, key: Key, context: &Context) {
        let exchange = self
            .templates
            .get(&key)
            .and_then(|template| template.request.exchange);
        self.forget(&key);
        tracing::debug!(stack = context.name(), peer = %key.0, token = %key.1, "Blockwise transfer aborted");
        context.fail_up(Failure {
            exchange,
            peer: key.0,
            token: key.1,
            reason: FailureReason::TransferAborted,
        });
    }

    /// Answers `request` from within the layer.
    fn answer(
        &self,
        request: &Message,
        code: Code,
        block1: Option<Block>,
        context: &Context,
    ) -> Result<(), ReceiveError> {
        let mut response = Message::response_to(request, code);
        if let Some(block) = block1 {
            block.write(&mut response.options, OptionNumber::BLOCK1);
        }
        context.send_down(response)?;
        Ok(())
    }

    fn send_request(&self, message: Message, context: &Context) -> Result<(), SendError> {
        let key = (message.peer, message.token);
        let mut template = message.clone();
        template.payload = Payload::empty();
        strip(&mut template, OptionNumber::BLOCK1, OptionNumber::SIZE1);
        self.templates.insert(
            key,
            Template {
                request: template,
                created: Instant::now(),
            },
        );

        let first = match self.split(&message.payload) {
            Some(szx) => {
                let first = cut(&message, OptionNumber::BLOCK1, 0, szx);
                tracing::debug!(
                    stack = context.name(),
                    len = message.payload.len(),
                    size = Block::size_of(szx),
                    "Sending request body in blocks"
                );
                self.uploads.insert(
                    key,
                    Upload {
                        request: message,
                        szx,
                        sent: 0,
                        retries: 0,
                        created: Instant::now(),
                    },
                );
                first
            }
            None => Some(message),
        };
        let Some(first) = first else {
            self.forget(&key);
            return Ok(());
        };
        context.send_down(first).map_err(|e| {
            self.forget(&key);
            e
        })
    }

    fn send_response(&self, mut message: Message, context: &Context) -> Result<(), SendError> {
        let key = (message.peer, message.token);
        let echo = self.echoes.remove(&key).map(|(_, (block, _))| block);
        let mut first = match self.split(&message.payload) {
            Some(szx) => {
                let first = cut(&message, OptionNumber::BLOCK2, 0, szx);
                tracing::debug!(
                    stack = context.name(),
                    len = message.payload.len(),
                    size = Block::size_of(szx),
                    "Serving response body in blocks"
                );
                message.reply_to = None;
                self.served.insert(
                    key,
                    Served {
                        response: message,
                        szx,
                        created: Instant::now(),
                    },
                );
                match first {
                    Some(first) => first,
                    None => return Ok(()),
                }
            }
            None => message,
        };
        if let Some(block) = echo {
            block.write(&mut first.options, OptionNumber::BLOCK1);
        }
        context.send_down(first)
    }

    fn receive_request(&self, request: Message, context: &Context) -> Result<(), ReceiveError> {
        let key = (request.peer, request.token);
        match Block::read(&request.options, OptionNumber::BLOCK2) {
            Some(Ok(block)) if block.num > 0 && self.served.contains_key(&key) => {
                return self.serve_block(request, block, context);
            }
            Some(Err(e)) => {
                tracing::debug!(stack = context.name(), %request, "Bad Block2 option: {}", e);
                return self.answer(&request, Code::BAD_OPTION, None, context);
            }
            _ => {
                // A new request ends any body we were still serving
                self.served.remove(&key);
            }
        }
        match Block::read(&request.options, OptionNumber::BLOCK1) {
            None => context.receive_up(request),
            Some(Ok(block)) => self.assemble(request, block, context),
            Some(Err(e)) => {
                tracing::debug!(stack = context.name(), %request, "Bad Block1 option: {}", e);
                self.answer(&request, Code::BAD_OPTION, None, context)
            }
        }
    }

    /// Answers a request for a further block of a response body.
    fn serve_block(&self, request: Message, block: Block, context: &Context) -> Result<(), ReceiveError> {
        let key = (request.peer, request.token);
        let part = match self.served.get(&key) {
            Some(served) if served.szx != block.szx => Err(Code::REQUEST_ENTITY_INCOMPLETE),
            Some(served) => cut(&served.response, OptionNumber::BLOCK2, block.num, served.szx)
                .ok_or(Code::BAD_OPTION),
            None => Err(Code::REQUEST_ENTITY_INCOMPLETE),
        };
        match part {
            Ok(mut part) => {
                let more = matches!(
                    Block::read(&part.options, OptionNumber::BLOCK2),
                    Some(Ok(Block { more: true, .. }))
                );
                if !more {
                    self.served.remove(&key);
                }
                let header = Message::response_to(&request, part.code);
                part.kind = header.kind;
                part.mid = header.mid;
                part.reply_to = header.reply_to;
                part.exchange = None;
                tracing::trace!(stack = context.name(), num = block.num, more, "Serving block");
                context.send_down(part)?;
                Ok(())
            }
            Err(code) => {
                self.served.remove(&key);
                self.answer(&request, code, None, context)
            }
        }
    }

    /// Collects one block of a request body.
    fn assemble(&self, request: Message, block: Block, context: &Context) -> Result<(), ReceiveError> {
        let key = (request.peer, request.token);
        if block.num == 0 {
            self.assemblies
                .entry(key)
                .or_insert_with(|| Reassembly::new(block.szx));
        }
        let progress = match self.assemblies.get_mut(&key) {
            Some(mut assembly) => assembly.offer(block, &request.payload, self.max_retries),
            None => Progress::Unknown,
        };
        match progress {
            Progress::Accepted { more: true } | Progress::Duplicate => {
                self.answer(&request, Code::CONTINUE, Some(block), context)
            }
            Progress::Accepted { more: false } => {
                let Some((_, assembly)) = self.assemblies.remove(&key) else {
                    return Ok(());
                };
                let mut whole = request;
                whole.payload = assembly.buffer;
                strip(&mut whole, OptionNumber::BLOCK1, OptionNumber::SIZE1);
                self.echoes.insert(key, (block, Instant::now()));
                tracing::debug!(stack = context.name(), len = whole.payload.len(), "Request body reassembled");
                context.receive_up(whole)
            }
            Progress::OutOfOrder {
                expected,
                give_up: false,
            } => {
                tracing::debug!(stack = context.name(), num = block.num, expected, "Request block out of order");
                let previous = Block::new(expected.saturating_sub(1), true, block.szx);
                self.answer(&request, Code::CONTINUE, Some(previous), context)
            }
            Progress::OutOfOrder { give_up: true, .. } | Progress::SizeChanged | Progress::Unknown => {
                tracing::debug!(stack = context.name(), %request, ?progress, "Rejecting request body");
                self.assemblies.remove(&key);
                self.answer(&request, Code::REQUEST_ENTITY_INCOMPLETE, None, context)
            }
        }
    }

    fn receive_response(&self, mut response: Message, context: &Context) -> Result<(), ReceiveError> {
        let key = (response.peer, response.token);
        if self.uploads.contains_key(&key) {
            match Block::read(&response.options, OptionNumber::BLOCK1) {
                Some(Ok(block)) if response.code == Code::CONTINUE => {
                    return self.continue_upload(key, block, context);
                }
                _ => {
                    self.uploads.remove(&key);
                    response.options.remove(OptionNumber::BLOCK1);
                }
            }
        }
        match Block::read(&response.options, OptionNumber::BLOCK2) {
            Some(Ok(block)) if block.more || block.num > 0 => self.download(response, block, context),
            Some(Err(e)) => {
                tracing::debug!(stack = context.name(), %response, "Bad Block2 option: {}", e);
                self.abort(key, context);
                Ok(())
            }
            _ => {
                self.templates.remove(&key);
                strip(&mut response, OptionNumber::BLOCK2, OptionNumber::SIZE2);
                context.receive_up(response)
            }
        }
    }

    /// Sends the next block of a request body after the peer asked for it.
    fn continue_upload(&self, key: Key, acknowledged: Block, context: &Context) -> Result<(), ReceiveError> {
        let next = match self.uploads.get_mut(&key) {
            Some(mut upload) if acknowledged.szx == upload.szx => {
                let num = acknowledged.num + 1;
                if num != upload.sent + 1 {
                    upload.retries += 1;
                }
                if upload.retries > self.max_retries {
                    None
                } else {
                    let part = cut(&upload.request, OptionNumber::BLOCK1, num, upload.szx);
                    if part.is_some() {
                        upload.sent = num;
                    }
                    part
                }
            }
            _ => None,
        };
        match next {
            Some(part) => {
                tracing::trace!(stack = context.name(), num = acknowledged.num + 1, "Sending request block");
                if let Err(e) = context.send_down(part) {
                    tracing::warn!(stack = context.name(), "Failed to send request block: {}", e);
                    self.abort(key, context);
                }
            }
            None => self.abort(key, context),
        }
        Ok(())
    }

    /// Collects one block of a response body and asks for the next.
    fn download(&self, response: Message, block: Block, context: &Context) -> Result<(), ReceiveError> {
        let key = (response.peer, response.token);
        if block.num == 0 {
            self.downloads
                .entry(key)
                .or_insert_with(|| Reassembly::new(block.szx));
        }
        let progress = match self.downloads.get_mut(&key) {
            Some(mut download) => download.offer(block, &response.payload, self.max_retries),
            None => Progress::Unknown,
        };
        match progress {
            Progress::Accepted { more: true } => self.request_block(key, block.num + 1, block.szx, context),
            Progress::Accepted { more: false } => {
                let Some((_, download)) = self.downloads.remove(&key) else {
                    return Ok(());
                };
                self.templates.remove(&key);
                let mut whole = response;
                whole.payload = download.buffer;
                strip(&mut whole, OptionNumber::BLOCK2, OptionNumber::SIZE2);
                tracing::debug!(stack = context.name(), len = whole.payload.len(), "Response body reassembled");
                context.receive_up(whole)
            }
            Progress::Duplicate => {
                tracing::trace!(stack = context.name(), num = block.num, "Dropping duplicate response block");
                Ok(())
            }
            Progress::OutOfOrder {
                expected,
                give_up: false,
            } => {
                tracing::debug!(stack = context.name(), num = block.num, expected, "Response block out of order");
                self.request_block(key, expected, block.szx, context)
            }
            Progress::OutOfOrder { give_up: true, .. } | Progress::SizeChanged => {
                self.abort(key, context);
                Ok(())
            }
            Progress::Unknown if self.templates.contains_key(&key) => {
                tracing::debug!(stack = context.name(), %response, "Response body does not start at block 0");
                self.abort(key, context);
                Ok(())
            }
            Progress::Unknown => {
                tracing::debug!(stack = context.name(), %response, "Response block for no known transfer");
                Ok(())
            }
        }
    }

    fn request_block(&self, key: Key, num: u32, szx: u8, context: &Context) -> Result<(), ReceiveError> {
        let request = self
            .templates
            .get(&key)
            .map(|template| template.request.clone());
        let Some(mut request) = request else {
            tracing::debug!(stack = context.name(), peer = %key.0, token = %key.1, "No request to continue");
            self.downloads.remove(&key);
            return Ok(());
        };
        Block::new(num, false, szx).write(&mut request.options, OptionNumber::BLOCK2);
        tracing::trace!(stack = context.name(), num, "Requesting response block");
        if let Err(e) = context.send_down(request) {
            tracing::warn!(stack = context.name(), "Failed to request block: {}", e);
            self.abort(key, context);
        }
        Ok(())
    }

    fn sweep(&self, context: &Context) {
        let lifetime = self.lifetime;
        let expired: Vec<Key> = self
            .uploads
            .iter()
            .filter(|upload| upload.created.elapsed() >= lifetime)
            .map(|upload| *upload.key())
            .chain(
                self.downloads
                    .iter()
                    .filter(|download| download.created.elapsed() >= lifetime)
                    .map(|download| *download.key()),
            )
            .collect();
        for key in expired {
            self.abort(key, context);
        }
        self.templates
            .retain(|_, template| template.created.elapsed() < lifetime);
        self.assemblies
            .retain(|_, assembly| assembly.created.elapsed() < lifetime);
        self.served
            .retain(|_, served| served.created.elapsed() < lifetime);
        self.echoes.retain(|_, (_, at)| at.elapsed() < lifetime);
    }
}

impl Layer for TransferLayer {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn send(self: Arc<Self>, message: Message, context: Context) -> Result<(), SendError> {
        if message.is_request() {
            self.send_request(message, &context)
        } else if message.is_response() {
            self.send_response(message, &context)
        } else {
            context.send_down(message)
        }
    }

    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError> {
        if message.is_request() {
            self.receive_request(message, &context)
        } else if message.is_response() {
            self.receive_response(message, &context)
        } else {
            context.receive_up(message)
        }
    }

    fn fail(self: Arc<Self>, failure: Failure, context: Context) {
        self.forget(&(failure.peer, failure.token));
        context.fail_up(failure)
    }

    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        match cancellation.token {
            Some(token) => self.forget(&(cancellation.peer, token)),
            None => {
                let keys: Vec<Key> = self
                    .templates
                    .iter()
                    .filter(|template| template.request.exchange == Some(cancellation.exchange))
                    .map(|template| *template.key())
                    .collect();
                for key in keys {
                    self.forget(&key);
                }
            }
        }
        context.cancel_down(cancellation)
    }

    fn start(self: Arc<Self>, context: Context, shutdown: Shutdown) {
        let layer = self.clone();
        every(self.lifetime / 4, shutdown, move || layer.sweep(&context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::ExchangeId,
        layer::Chain,
        layers::testing::Probe,
        message::{MessageType, Method},
    };

    fn peer() -> SocketAddr {
        "10.0.0.2:5683".parse().unwrap()
    }

    fn setup(block_size: usize) -> (Arc<Chain>, Arc<Probe>, Arc<Probe>) {
        let config = StackConfig {
            block_size,
            max_block_retries: 2,
            ..Default::default()
        };
        let top = Probe::new();
        let bottom = Probe::transparent();
        let chain = Chain::new(
            "test".into(),
            vec![top.clone(), Arc::new(TransferLayer::new(&config)), bottom.clone()],
        );
        chain.start(&Shutdown::new());
        (chain, top, bottom)
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn put(mid: u16) -> Message {
        let mut request = Message::request(MessageType::Confirmable, Method::Put);
        request.peer = peer();
        request.mid = mid;
        request.token = Token::from_u32(7);
        request
    }

    fn request_block(num: u32, more: bool, data: &[u8]) -> Message {
        let mut request = put(100 + num as u16).with_payload(data.to_vec());
        Block::new(num, more, 0).write(&mut request.options, OptionNumber::BLOCK1);
        request
    }

    fn block_of(message: &Message, number: OptionNumber) -> Block {
        Block::read(&message.options, number).unwrap().unwrap()
    }

    #[tokio::test]
    async fn reassembles_request_body() {
        let (chain, top, bottom) = setup(0);
        let data = body(40);
        chain.receive(request_block(0, true, &data[..16])).unwrap();
        chain.receive(request_block(1, true, &data[16..32])).unwrap();
        chain.receive(request_block(2, false, &data[32..])).unwrap();

        let continues = bottom.sent();
        assert_eq!(continues.len(), 2);
        assert!(continues.iter().all(|(m, _)| m.code == Code::CONTINUE));
        assert_eq!(block_of(&continues[1].0, OptionNumber::BLOCK1).num, 1);

        let received = top.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.payload.to_vec(), data);
        assert!(!received[0].0.options.contains(OptionNumber::BLOCK1));

        // The final response echoes the last block
        let request = received[0].0.clone();
        chain
            .send(Message::response_to(&request, Code::CHANGED))
            .unwrap();
        let response = bottom.sent().pop().unwrap().0;
        assert_eq!(block_of(&response, OptionNumber::BLOCK1), Block::new(2, false, 0));
    }

    #[tokio::test]
    async fn early_request_block_is_asked_again() {
        let (chain, top, bottom) = setup(0);
        let data = body(48);
        chain.receive(request_block(0, true, &data[..16])).unwrap();
        chain.receive(request_block(2, true, &data[32..])).unwrap();
        let again = bottom.sent().pop().unwrap().0;
        assert_eq!(again.code, Code::CONTINUE);
        assert_eq!(block_of(&again, OptionNumber::BLOCK1).num, 0);

        chain.receive(request_block(1, true, &data[16..32])).unwrap();
        chain.receive(request_block(2, false, &data[32..])).unwrap();
        assert_eq!(top.received()[0].0.payload.to_vec(), data);
    }

    #[tokio::test]
    async fn too_many_early_blocks_abandon_request_body() {
        let (chain, top, bottom) = setup(0);
        chain.receive(request_block(0, true, &[0; 16])).unwrap();
        for _ in 0..3 {
            chain.receive(request_block(5, true, &[0; 16])).unwrap();
        }
        let last = bottom.sent().pop().unwrap().0;
        assert_eq!(last.code, Code::REQUEST_ENTITY_INCOMPLETE);
        // Nothing is left to continue
        chain.receive(request_block(1, false, &[0; 4])).unwrap();
        assert_eq!(
            bottom.sent().pop().unwrap().0.code,
            Code::REQUEST_ENTITY_INCOMPLETE
        );
        assert!(top.received().is_empty());
    }

    #[tokio::test]
    async fn block_size_change_is_rejected() {
        let (chain, _top, bottom) = setup(0);
        chain.receive(request_block(0, true, &[0; 16])).unwrap();
        let mut bigger = put(120).with_payload(vec![0; 32]);
        Block::new(1, true, 1).write(&mut bigger.options, OptionNumber::BLOCK1);
        chain.receive(bigger).unwrap();
        assert_eq!(
            bottom.sent().pop().unwrap().0.code,
            Code::REQUEST_ENTITY_INCOMPLETE
        );
    }

    #[tokio::test]
    async fn uploads_request_body_on_continue() {
        let (chain, top, bottom) = setup(16);
        let data = body(40);
        let mut request = put(0).with_payload(data.clone());
        request.exchange = Some(ExchangeId::new(1));
        chain.send(request.clone()).unwrap();

        let first = bottom.sent()[0].0.clone();
        assert_eq!(first.payload.to_vec(), data[..16].to_vec());
        assert_eq!(block_of(&first, OptionNumber::BLOCK1), Block::new(0, true, 0));
        assert_eq!(first.options.get_uint(OptionNumber::SIZE1), Some(40));

        for num in 0..2 {
            let mut proceed = Message::response_to(&request, Code::CONTINUE);
            Block::new(num, true, 0).write(&mut proceed.options, OptionNumber::BLOCK1);
            chain.receive(proceed).unwrap();
        }
        let sent = bottom.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].0.payload.to_vec(), data[32..].to_vec());
        assert_eq!(block_of(&sent[2].0, OptionNumber::BLOCK1), Block::new(2, false, 0));
        assert!(top.received().is_empty());

        let mut done = Message::response_to(&request, Code::CHANGED);
        Block::new(2, false, 0).write(&mut done.options, OptionNumber::BLOCK1);
        chain.receive(done).unwrap();
        let received = top.received();
        assert_eq!(received.len(), 1);
        assert!(!received[0].0.options.contains(OptionNumber::BLOCK1));
    }

    fn get() -> Message {
        let mut request = Message::request(MessageType::Confirmable, Method::Get);
        request.peer = peer();
        request.token = Token::from_u32(9);
        request.exchange = Some(ExchangeId::new(2));
        request
    }

    fn response_block(request: &Message, num: u32, more: bool, data: &[u8]) -> Message {
        let mut response = Message::response_to(request, Code::CONTENT).with_payload(data.to_vec());
        response.kind = MessageType::Acknowledgement;
        response.exchange = None;
        Block::new(num, more, 0).write(&mut response.options, OptionNumber::BLOCK2);
        response
    }

    #[tokio::test]
    async fn downloads_response_body() {
        let (chain, top, bottom) = setup(0);
        let request = get();
        chain.send(request.clone()).unwrap();
        let data = body(40);
        chain
            .receive(response_block(&request, 0, true, &data[..16]))
            .unwrap();
        chain
            .receive(response_block(&request, 1, true, &data[16..32]))
            .unwrap();
        chain
            .receive(response_block(&request, 2, false, &data[32..]))
            .unwrap();

        let sent = bottom.sent();
        assert_eq!(sent.len(), 3);
        for (num, (follow_up, _)) in sent[1..].iter().enumerate() {
            assert_eq!(follow_up.token, request.token);
            assert_eq!(follow_up.exchange, request.exchange);
            assert_eq!(block_of(follow_up, OptionNumber::BLOCK2).num, num as u32 + 1);
        }
        let received = top.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.payload.to_vec(), data);
        assert!(!received[0].0.options.contains(OptionNumber::BLOCK2));
    }

    #[tokio::test]
    async fn early_response_block_is_asked_again_then_aborts() {
        let (chain, top, bottom) = setup(0);
        let request = get();
        chain.send(request.clone()).unwrap();
        chain
            .receive(response_block(&request, 0, true, &[1; 16]))
            .unwrap();
        // A duplicate changes nothing
        chain
            .receive(response_block(&request, 0, true, &[1; 16]))
            .unwrap();
        chain
            .receive(response_block(&request, 2, true, &[3; 16]))
            .unwrap();
        let again = bottom.sent().pop().unwrap().0;
        assert_eq!(block_of(&again, OptionNumber::BLOCK2).num, 1);

        for _ in 0..2 {
            chain
                .receive(response_block(&request, 3, true, &[4; 16]))
                .unwrap();
        }
        let failures = top.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.reason, FailureReason::TransferAborted);
        assert_eq!(failures[0].0.exchange, Some(ExchangeId::new(2)));
        assert!(top.received().is_empty());
    }

    #[tokio::test]
    async fn response_body_missing_its_start_aborts() {
        let (chain, top, bottom) = setup(0);
        let request = get();
        chain.send(request.clone()).unwrap();
        chain
            .receive(response_block(&request, 2, true, &[3; 16]))
            .unwrap();

        assert_eq!(bottom.sent().len(), 1);
        let failures = top.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.reason, FailureReason::TransferAborted);
        assert_eq!(failures[0].0.exchange, Some(ExchangeId::new(2)));
        assert!(top.received().is_empty());
    }

    #[tokio::test]
    async fn serves_response_body_on_request() {
        let (chain, _top, bottom) = setup(16);
        let mut request = get();
        request.exchange = None;
        request.mid = 50;
        let data = body(20);
        chain
            .send(Message::response_to(&request, Code::CONTENT).with_payload(data.clone()))
            .unwrap();
        let first = bottom.sent()[0].0.clone();
        assert_eq!(block_of(&first, OptionNumber::BLOCK2), Block::new(0, true, 0));
        assert_eq!(first.options.get_uint(OptionNumber::SIZE2), Some(20));

        let mut follow_up = request.clone();
        follow_up.mid = 51;
        Block::new(1, false, 0).write(&mut follow_up.options, OptionNumber::BLOCK2);
        chain.receive(follow_up.clone()).unwrap();
        let second = bottom.sent()[1].0.clone();
        assert_eq!(second.payload.to_vec(), data[16..].to_vec());
        assert_eq!(block_of(&second, OptionNumber::BLOCK2), Block::new(1, false, 0));
        assert_eq!(second.reply_to.map(|reply_to| reply_to.mid), Some(51));

        // The body was served completely
        follow_up.mid = 52;
        chain.receive(follow_up).unwrap();
        assert_eq!(bottom.sent().len(), 2);
    }

    #[tokio::test]
    async fn small_bodies_pass_untouched() {
        let (chain, top, bottom) = setup(16);
        let request = get().with_payload(vec![1; 16]);
        chain.send(request.clone()).unwrap();
        assert_eq!(bottom.sent()[0].0, request);
        let mut response = Message::response_to(&request, Code::CONTENT).with_payload("ok");
        response.exchange = None;
        chain.receive(response.clone()).unwrap();
        assert_eq!(top.received()[0].0, response);
    }
}
