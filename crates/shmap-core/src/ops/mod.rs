pub mod callbacks;
pub mod collectives;
pub mod control_flow;
pub mod elementwise;

pub use callbacks::{CallbackKind, DebugCallbackOp, DevicePutOp, HostCallback, HostCallbackOp, TieOp};
pub use collectives::{
    AllGatherOp, AllToAllOp, AxisIndexOp, PmaxOp, PminOp, PpermuteOp, PsumInvariantOp, PsumOp, PvaryOp,
    ReduceScatterOp,
};
pub use control_flow::{CallOp, CondOp, CustomJvpCallOp, CustomVjpCallOp, RematOp, ScanOp, WhileOp};
pub use elementwise::{
    AddOp, CosOp, DivOp, ExpOp, LogOp, LtOp, MaxOp, MinOp, MulOp, NegOp, ReduceSumOp, ReshapeOp, SinOp, SubOp,
};
