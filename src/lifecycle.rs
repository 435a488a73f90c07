//! Which actions each party may take at each step of a deal
//!
//! The table is keyed by role, the side as the user experiences it, and deal
//! state. A maker's side is the offer's side; a taker trades the opposite way.
//! Either party may cancel a requested deal. Once it is accepted, cancel stays
//! with the maker selling and the taker buying, which are both parties of a
//! SELL offer; neither party of a BUY offer keeps it.
use super::error::ValidationError;
use super::types::{DealState, Role, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Request,
    Accept,
    Cancel,
    MarkPaid,
    Release,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Request,
        Action::Accept,
        Action::Cancel,
        Action::MarkPaid,
        Action::Release,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Action::Request => "Request",
            Action::Accept => "Accept",
            Action::Cancel => "Cancel",
            Action::MarkPaid => "Mark as paid",
            Action::Release => "Release",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommentSpec {
    pub label: &'static str,
    pub placeholder: &'static str,
    pub required: bool,
}

impl CommentSpec {
    /// The text to forward, or `None` when nothing usable was typed.
    ///
    /// Required comments are trimmed; optional ones are sent as typed.
    pub fn payload(&self, comment: Option<&str>) -> Option<String> {
        let comment = comment.unwrap_or_default();
        if self.required {
            Some(comment.trim())
                .filter(|c| !c.is_empty())
                .map(str::to_string)
        } else if comment.trim().is_empty() {
            None
        } else {
            Some(comment.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenario {
    pub instructions: &'static str,
    pub comment: Option<CommentSpec>,
    pub primary: Option<Action>,
    pub secondary: Option<Action>,
}

impl Scenario {
    pub fn allows(&self, action: Action) -> bool {
        self.primary == Some(action) || self.secondary == Some(action)
    }

    /// The comment spec that gates `action`. Only the primary action is gated.
    pub fn comment_for(&self, action: Action) -> Option<CommentSpec> {
        self.comment.filter(|_| self.primary == Some(action))
    }

    /// The note to send with `action`, or the local refusal when a required
    /// comment is missing. Ungated actions pass any comment on untouched.
    pub fn note_for(
        &self,
        action: Action,
        comment: Option<&str>,
    ) -> Result<Option<String>, ValidationError> {
        let spec = self.comment_for(action).unwrap_or(MESSAGE);
        match spec.payload(comment) {
            None if spec.required => Err(ValidationError::CommentRequired { label: spec.label }),
            note => Ok(note),
        }
    }
}

const PAYMENT_DETAILS: CommentSpec = CommentSpec {
    label: "Payment details",
    placeholder: "Where the buyer should send the fiat payment",
    required: true,
};

const MESSAGE: CommentSpec = CommentSpec {
    label: "Message",
    placeholder: "Optional note for your counterpart",
    required: false,
};

pub fn user_side(role: Role, offer_side: Side) -> Side {
    match role {
        Role::Maker => offer_side,
        Role::Taker => offer_side.inverse(),
    }
}

/// Looks up the cell for `(role, side, state)`, where `side` is the
/// user-facing side. `None` only for a maker in `New`, which makers never see.
pub fn scenario(role: Role, side: Side, state: DealState) -> Option<Scenario> {
    use Action::*;
    use DealState as S;

    let cell = |instructions, comment, primary, secondary| Scenario {
        instructions,
        comment,
        primary,
        secondary,
    };

    let scenario = match (role, side, state) {
        (Role::Maker, _, S::New) => return None,

        (Role::Taker, Side::Buy, S::New) => cell(
            "Choose an amount and payment method, then send your request to the seller.",
            Some(MESSAGE),
            Some(Request),
            None,
        ),
        (Role::Taker, Side::Sell, S::New) => cell(
            "Choose an amount and add the details where the buyer should pay you.",
            Some(PAYMENT_DETAILS),
            Some(Request),
            None,
        ),

        (Role::Maker, Side::Sell, S::Requested) => cell(
            "A buyer requested this deal. Accept to lock the tokens in escrow and share your payment details.",
            Some(PAYMENT_DETAILS),
            Some(Accept),
            Some(Cancel),
        ),
        (Role::Maker, Side::Buy, S::Requested) => cell(
            "A seller requested this deal. Accept to have the tokens locked in escrow.",
            Some(MESSAGE),
            Some(Accept),
            Some(Cancel),
        ),
        (Role::Taker, _, S::Requested) => cell(
            "Waiting for the maker to accept your request.",
            None,
            Some(Cancel),
            None,
        ),

        (Role::Maker, Side::Sell, S::Accepted) => cell(
            "Tokens are in escrow. Wait for the buyer to send the fiat payment.",
            None,
            None,
            Some(Cancel),
        ),
        (Role::Maker, Side::Buy, S::Accepted) => cell(
            "Tokens are in escrow. Send the fiat payment, then mark the deal as paid.",
            Some(MESSAGE),
            Some(MarkPaid),
            None,
        ),
        (Role::Taker, Side::Buy, S::Accepted) => cell(
            "Tokens are in escrow. Send the fiat payment, then mark the deal as paid.",
            Some(MESSAGE),
            Some(MarkPaid),
            Some(Cancel),
        ),
        (Role::Taker, Side::Sell, S::Accepted) => cell(
            "Tokens are in escrow. Wait for the buyer to send the fiat payment.",
            None,
            None,
            None,
        ),

        (_, Side::Sell, S::Paid) => cell(
            "The buyer marked the deal as paid. Check that the payment arrived, then release the tokens.",
            Some(MESSAGE),
            Some(Release),
            None,
        ),
        (_, Side::Buy, S::Paid) => cell(
            "Payment sent. Waiting for the seller to release the tokens.",
            None,
            None,
            None,
        ),

        (_, _, S::Released) => cell("Deal complete. The tokens were released.", None, None, None),
        (_, _, S::Canceled) => cell("This deal was canceled.", None, None, None),
    };
    Some(scenario)
}
