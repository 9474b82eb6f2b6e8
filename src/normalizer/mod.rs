pub mod client;
pub mod node;
pub mod process;
pub mod queue;
pub mod updater;

pub use client::{Normalizer, ScoreChangePolicy, ScoringNormalizer};
pub use node::{
    BucketInfluencerNode, BucketNode, InfluencerNode, Level, RecordNode, ResultNode,
    BUCKET_INFLUENCERS, RECORDS,
};
pub use process::{
    NativeScoringProcessFactory, NormalizerResult, ScoringProcess, ScoringProcessFactory,
};
pub use queue::{RenormalizationQueue, RenormalizationRequest};
pub use updater::{RenormalizationSummary, ScoresUpdater, UpdateLimits};
