mod chat_actor;
