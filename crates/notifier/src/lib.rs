//! Delivery transports and the workers that drain them.
//!
//! - [`queue`]: Redis sorted-set delay queues backing the job queue and the
//!   mail queue, plus the Redis socket broadcaster.
//! - [`mail`]: SMTP transport and the mail handlers that turn a queued
//!   [`MailRequest`](notice_engine::delivery::MailRequest) into a message.
//! - [`worker`]: poll loops firing due delivery jobs and due emails.
//! - [`runtime`]: production wiring of the service over Postgres and Redis.

pub mod mail;
pub mod queue;
pub mod runtime;
pub mod worker;
