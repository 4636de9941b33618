// Market data module entrypoint
pub mod adapters;     // per-broker frame decoders
pub mod cache;        // candle/quote/payout caches shared with the facade
pub mod cascade;      // ordered acquisition strategies, synthetic last
pub mod discovery;    // payout-driven instrument selection
pub mod facade;       // consumer API
pub mod interceptor;  // streamed frames -> caches
pub mod navigator;    // broker UI driving (current asset, payout, switch)
pub mod normaliser;   // instrument spellings -> cache keys
pub mod page;         // in-page scripts and DOM price mining
pub mod profile;      // per-broker selectors and tab matching
pub mod router;       // facade requests served on the session loop
pub mod secondary;    // in-page socket hook buffer
pub mod series;
pub mod types;
