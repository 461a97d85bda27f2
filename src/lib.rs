//! Charhub - character hub of a game-server cluster
//!
//! Owns the durable view of every account, character, guild and party,
//! brokers which map server owns a player, and keeps the relational store
//! in step with its in-memory caches.

// ============================================
// Core Modules
// ============================================

/// Hub configuration (YAML)
pub mod config;
/// Server implementations
pub mod servers;
