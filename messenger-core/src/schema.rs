use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    chats (id) {
        id -> BigInt,
        chat_type -> Text,
        match_id -> Nullable<BigInt>,
        created_at -> Timestamptz,
    }
}

table! {
    chat_memberships (chat_id, user_id) {
        chat_id -> BigInt,
        user_id -> BigInt,
        user_role -> Text,
        permissions -> Integer,
        is_primary -> Bool,
        last_read_message_id -> Nullable<BigInt>,
        last_received_message_id -> Nullable<BigInt>,
    }
}

table! {
    messages (id) {
        id -> BigInt,
        chat_id -> BigInt,
        sender_id -> Nullable<BigInt>,
        content -> Bytea,
        reply_to -> Nullable<BigInt>,
        delivery_status -> SmallInt,
        created_at -> Timestamptz,
        edited_at -> Nullable<Timestamptz>,
        deleted_at -> Nullable<Timestamptz>,
    }
}

table! {
    message_reactions (message_id, user_id, emoji) {
        message_id -> BigInt,
        user_id -> BigInt,
        emoji -> Text,
        created_at -> Timestamptz,
    }
}

table! {
    push_subscriptions (device_id) {
        device_id -> Uuid,
        user_id -> BigInt,
        endpoint -> Text,
        p256dh -> Text,
        auth -> Text,
        created_at -> Timestamptz,
        last_alive_at -> Timestamptz,
    }
}

table! {
    tickets (id) {
        id -> BigInt,
        chat_id -> BigInt,
        status -> Text,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
    }
}

joinable!(chat_memberships -> chats (chat_id));
joinable!(messages -> chats (chat_id));
joinable!(tickets -> chats (chat_id));

allow_tables_to_appear_in_same_query!(
    chats,
    chat_memberships,
    messages,
    message_reactions,
    push_subscriptions,
    tickets,
);
