//! Tether Model - Board Entities
//!
//! Typed entities over the sync engine. Every entity is obtained through
//! its `get` constructor, which returns the environment's shared instance:
//!
//! ```ignore
//! let card = Card::get(&env, "5a2f...")?;
//! card.name().set("Write the release notes".to_string())?;
//! card.flush(&CancellationToken::new()).await?;
//! ```
//!
//! | Entity      | Nested collection          | Deletable |
//! |-------------|----------------------------|-----------|
//! | [`List`]      | [`Card`]s (`cards`)          | no        |
//! | [`Card`]      | [`CheckList`]s (`checklists`) | yes       |
//! | [`CheckList`] | [`CheckItem`]s (`checkItems`) | yes       |
//! | [`CheckItem`] | -                          | yes       |

pub mod card;
pub mod check_item;
pub mod checklist;
pub mod list;

pub use card::Card;
pub use check_item::{CheckItem, CheckItemState};
pub use checklist::CheckList;
pub use list::List;
