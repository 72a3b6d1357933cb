//! 核心通信模块
//!
//! 共享内存段、单槽消息通道与延迟发送队列

pub mod channel;
pub mod msg_queue;
pub mod shared_mem;

pub use channel::{ChannelId, MsgChannel};
pub use msg_queue::DeferredQueue;
pub use shared_mem::{
    segment_name, HeapSegment, HeapSegments, SegmentFactory, SharedSegment, ShmemFactory,
    ShmemSegment,
};
