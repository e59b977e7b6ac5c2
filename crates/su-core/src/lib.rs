//! Value representation, persistent collections and the tracing garbage
//! collector shared by every piece of the Saurus virtual machine.

pub mod error;
pub mod gc;
pub mod heap;
pub mod intern;
pub mod map;
pub mod proto;
pub mod seq;
pub mod value;
pub mod vector;

pub use error::{LoaderError, LoaderResult, SuError, SuResult};
pub use gc::Heap;
pub use heap::{Arena, Color, Id};
pub use intern::{murmur2, StringTable, SuString};
pub use map::{MapArenas, MapId, MapNode, MapNodeId, PMapData};
pub use proto::{Closure, ClosureId, Constant, Instruction, OpCode, Prototype, ProtoId, ResolvedConstant, UpvalDesc};
pub use seq::{SeqCtx, SeqId, SeqNode, SeqSource};
pub use value::{
    hash_value, value_eq, FuncId, LocalId, NativeDataId, NativeFn, NativeHost, NativePtrId, StrId,
    Value, VectorId,
};
pub use vector::{VecArenas, VecNode, VecNodeId, PVec};
